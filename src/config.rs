use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::domain_xml::{LibvirtTemplate, NetworkMode, ResourceProfile};
use crate::error::SandpitError;
use crate::executor::ExecutorSettings;
use crate::pool::PoolSettings;
use crate::snapshot::RetentionPolicy;
use crate::vm::VmTiming;

#[derive(Debug, Clone, Default, Facet)]
pub struct Config {
    #[facet(default)]
    pub vm: VmConfig,
    #[facet(default)]
    pub pool: PoolConfig,
    #[facet(default)]
    pub snapshot: SnapshotConfig,
    #[facet(default)]
    pub executor: ExecutorConfig,
    #[facet(default)]
    pub advanced: AdvancedConfig,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct VmConfig {
    #[facet(default = 2)]
    pub vcpu: u32,
    #[facet(default = 2048)]
    pub memory_mib: u64,
    #[facet(default = 20)]
    pub disk_gib: u64,
    /// `nat-filtered` or `isolated`.
    #[facet(default = "nat-filtered")]
    pub network: String,
    #[facet(default = "sandpit")]
    pub name_prefix: String,
    #[facet(default = 120)]
    pub boot_timeout_s: u64,
    #[facet(default = 30)]
    pub stop_grace_s: u64,
    #[facet(default = 500)]
    pub poll_interval_ms: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            vcpu: 2,
            memory_mib: 2048,
            disk_gib: 20,
            network: "nat-filtered".into(),
            name_prefix: "sandpit".into(),
            boot_timeout_s: 120,
            stop_grace_s: 30,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct PoolConfig {
    #[facet(default = 2)]
    pub min_size: usize,
    #[facet(default = 5)]
    pub max_size: usize,
    #[facet(default = 3600)]
    pub ttl_s: u64,
    #[facet(default = 10000)]
    pub health_check_interval_ms: u64,
    #[facet(default = 1000)]
    pub replenish_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 5,
            ttl_s: 3600,
            health_check_interval_ms: 10_000,
            replenish_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct SnapshotConfig {
    /// 0 disables age-based retention.
    #[facet(default = 86400)]
    pub max_age_s: u64,
    /// 0 disables count-based retention.
    #[facet(default = 8)]
    pub max_count: usize,
    #[facet(default = 300)]
    pub sweep_interval_s: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_age_s: 86400,
            max_count: 8,
            sweep_interval_s: 300,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ExecutorConfig {
    #[facet(default = 30000)]
    pub acquire_timeout_ms: u64,
    #[facet(default = 2000)]
    pub cancel_grace_ms: u64,
    #[facet(default = 1048576)]
    pub output_cap_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 30_000,
            cancel_grace_ms: 2000,
            output_cap_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct AdvancedConfig {
    #[facet(default = "qemu:///system")]
    pub libvirt_uri: String,
    #[facet(default = "kvm")]
    pub domain_type: String,
    #[facet(default = "q35")]
    pub machine: String,
    #[facet(default = "/var/lib/sandpit/disks")]
    pub disk_dir: String,
    #[facet(default = "sandpit-nat")]
    pub nat_network: String,
    #[facet(default = "sandpit-isolated")]
    pub isolated_network: String,
    #[facet(default = "sandpit-egress")]
    pub nat_filter: String,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            libvirt_uri: "qemu:///system".into(),
            domain_type: "kvm".into(),
            machine: "q35".into(),
            disk_dir: "/var/lib/sandpit/disks".into(),
            nat_network: "sandpit-nat".into(),
            isolated_network: "sandpit-isolated".into(),
            nat_filter: "sandpit-egress".into(),
        }
    }
}

// ── derived settings ──────────────────────────────────────

impl Config {
    pub fn network_mode(&self) -> Result<NetworkMode, SandpitError> {
        self.vm.network.parse()
    }

    pub fn resource_profile(&self) -> ResourceProfile {
        ResourceProfile {
            vcpu: self.vm.vcpu,
            memory_mib: self.vm.memory_mib,
            disk_gib: self.vm.disk_gib,
        }
    }

    pub fn vm_timing(&self) -> VmTiming {
        VmTiming {
            boot_timeout: Duration::from_secs(self.vm.boot_timeout_s),
            stop_grace: Duration::from_secs(self.vm.stop_grace_s),
            poll_interval: Duration::from_millis(self.vm.poll_interval_ms),
        }
    }

    pub fn pool_settings(&self) -> Result<PoolSettings, SandpitError> {
        Ok(PoolSettings {
            min_size: self.pool.min_size,
            max_size: self.pool.max_size,
            ttl: Duration::from_secs(self.pool.ttl_s),
            health_check_interval: Duration::from_millis(self.pool.health_check_interval_ms),
            replenish_interval: Duration::from_millis(self.pool.replenish_interval_ms),
            sweep_interval: Duration::from_secs(self.snapshot.sweep_interval_s),
            name_prefix: self.vm.name_prefix.clone(),
            resources: self.resource_profile(),
            network_mode: self.network_mode()?,
            timing: self.vm_timing(),
        })
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age: (self.snapshot.max_age_s > 0)
                .then(|| Duration::from_secs(self.snapshot.max_age_s)),
            max_count: (self.snapshot.max_count > 0).then_some(self.snapshot.max_count),
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            acquire_timeout: Duration::from_millis(self.executor.acquire_timeout_ms),
            cancel_grace: Duration::from_millis(self.executor.cancel_grace_ms),
            output_cap: self.executor.output_cap_bytes,
        }
    }

    pub fn template(&self) -> LibvirtTemplate {
        LibvirtTemplate {
            domain_type: self.advanced.domain_type.clone(),
            machine: self.advanced.machine.clone(),
            disk_dir: PathBuf::from(&self.advanced.disk_dir),
            nat_network: self.advanced.nat_network.clone(),
            nat_filter: self.advanced.nat_filter.clone(),
            isolated_network: self.advanced.isolated_network.clone(),
        }
    }
}

// ── validation ────────────────────────────────────────────

fn validation(message: impl Into<String>) -> SandpitError {
    SandpitError::Validation {
        message: message.into(),
    }
}

/// Upper bound for every duration in the config.
const MAX_TIME_SETTING: Duration = Duration::from_secs(365 * 86_400);

fn validate_config(config: &Config) -> Result<(), SandpitError> {
    config.resource_profile().validate()?;
    config.network_mode()?;
    validate_name(&config.vm.name_prefix)?;

    if config.vm.boot_timeout_s == 0 {
        return Err(validation("vm.boot_timeout_s must be greater than zero"));
    }
    if config.vm.poll_interval_ms == 0 {
        return Err(validation("vm.poll_interval_ms must be greater than zero"));
    }

    if config.pool.max_size == 0 {
        return Err(validation("pool.max_size must be at least 1"));
    }
    if config.pool.min_size > config.pool.max_size {
        return Err(validation(format!(
            "pool.min_size ({}) must not exceed pool.max_size ({})",
            config.pool.min_size, config.pool.max_size
        )));
    }
    if config.pool.ttl_s == 0 {
        return Err(validation("pool.ttl_s must be greater than zero"));
    }
    if config.pool.health_check_interval_ms == 0 || config.pool.replenish_interval_ms == 0 {
        return Err(validation("pool intervals must be greater than zero"));
    }

    if config.snapshot.sweep_interval_s == 0 {
        return Err(validation("snapshot.sweep_interval_s must be greater than zero"));
    }

    if config.executor.output_cap_bytes == 0 {
        return Err(validation("executor.output_cap_bytes must be greater than zero"));
    }

    let timing = config.vm_timing();
    let executor = config.executor_settings();
    for (key, value) in [
        ("vm.boot_timeout_s", timing.boot_timeout),
        ("vm.stop_grace_s", timing.stop_grace),
        ("vm.poll_interval_ms", timing.poll_interval),
        ("pool.ttl_s", Duration::from_secs(config.pool.ttl_s)),
        ("pool.health_check_interval_ms", Duration::from_millis(config.pool.health_check_interval_ms)),
        ("pool.replenish_interval_ms", Duration::from_millis(config.pool.replenish_interval_ms)),
        ("snapshot.max_age_s", Duration::from_secs(config.snapshot.max_age_s)),
        ("snapshot.sweep_interval_s", Duration::from_secs(config.snapshot.sweep_interval_s)),
        ("executor.acquire_timeout_ms", executor.acquire_timeout),
        ("executor.cancel_grace_ms", executor.cancel_grace),
    ] {
        if value > MAX_TIME_SETTING {
            return Err(validation(format!(
                "{key} must not exceed {} days",
                MAX_TIME_SETTING.as_secs() / 86_400
            )));
        }
    }

    for (key, value) in [
        ("advanced.libvirt_uri", &config.advanced.libvirt_uri),
        ("advanced.nat_network", &config.advanced.nat_network),
        ("advanced.isolated_network", &config.advanced.isolated_network),
        ("advanced.nat_filter", &config.advanced.nat_filter),
    ] {
        if value.is_empty() {
            return Err(validation(format!("{key} must not be empty")));
        }
    }
    Ok(())
}

/// Domain names are built as `<prefix>-<suffix>`, so the prefix has to be a
/// valid name on its own.
fn validate_name(name: &str) -> Result<(), SandpitError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(validation(format!(
            "vm.name_prefix must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"
        )));
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn parse_config(contents: &str, origin: &Path) -> Result<Config, SandpitError> {
    let config: Config = facet_toml::from_str(contents).map_err(|e| SandpitError::ConfigParse {
        path: origin.display().to_string(),
        message: e.to_string(),
    })?;
    validate_config(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config, SandpitError> {
    let contents = std::fs::read_to_string(path).map_err(|source| SandpitError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&contents, path)
}
