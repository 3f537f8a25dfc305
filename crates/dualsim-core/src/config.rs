use std::net::SocketAddr;
use std::time::Duration;

use dualsim_common::models::CommandMode;
use dualsim_common::recovery::{
    RECOVERY_ORDINAL_COUNT, RESERVED_REREGISTER_ORDINAL, RecoveryAction,
};
use serde::Deserialize;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfigInput {
    pub version: u32,
    pub arbiter: ArbiterConfigInput,
    pub auto_switch: AutoSwitchConfigInput,
    pub recovery: RecoveryConfigInput,
    pub telemetry: TelemetryConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArbiterConfigInput {
    pub command_mode: Option<CommandMode>,
    pub max_data_attach: Option<usize>,
    pub modem_retry_ms: Option<u64>,
    pub emergency_override_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AutoSwitchConfigInput {
    /// Negative disables auto data switch entirely.
    pub stability_threshold_ms: Option<i64>,
    pub retry_interval_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub require_ping_test: Option<bool>,
    pub validation_timeout_ms: Option<u64>,
}

/// Both lists are indexed by rung ordinal, reserved gap included.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RecoveryConfigInput {
    pub delays_ms: Option<Vec<u64>>,
    pub skip: Option<Vec<bool>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetryConfigInput {
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbiterConfig {
    /// Forces a command family; otherwise the radio is asked at startup.
    pub command_mode: Option<CommandMode>,
    /// Slots that may be attached at once in allow-data mode. When it is at
    /// least the modem count, every slot stays attached.
    pub max_data_attach: usize,
    pub modem_retry: Duration,
    /// How long an accepted emergency override waits for its call.
    pub emergency_override_timeout: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            command_mode: None,
            max_data_attach: 1,
            modem_retry: Duration::from_secs(5),
            emergency_override_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoSwitchConfig {
    /// `None` disables auto data switch.
    pub stability_threshold: Option<Duration>,
    /// Base of the exponential validation retry back-off.
    pub retry_interval: Duration,
    pub max_retries: u32,
    pub require_ping_test: bool,
    pub validation_timeout: Duration,
}

impl Default for AutoSwitchConfig {
    fn default() -> Self {
        Self {
            stability_threshold: Some(Duration::from_secs(10)),
            retry_interval: Duration::from_secs(10),
            max_retries: 7,
            require_ping_test: true,
            validation_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryConfig {
    delays: [Duration; RECOVERY_ORDINAL_COUNT],
    skip: [bool; RECOVERY_ORDINAL_COUNT],
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        let mut skip = [false; RECOVERY_ORDINAL_COUNT];
        skip[RESERVED_REREGISTER_ORDINAL as usize] = true;
        Self {
            delays: [Duration::from_secs(180); RECOVERY_ORDINAL_COUNT],
            skip,
        }
    }
}

impl RecoveryConfig {
    /// Build from per-ordinal lists. The reserved ordinal is always skipped.
    pub fn new(
        delays: [Duration; RECOVERY_ORDINAL_COUNT],
        mut skip: [bool; RECOVERY_ORDINAL_COUNT],
    ) -> Result<Self, String> {
        skip[RESERVED_REREGISTER_ORDINAL as usize] = true;
        let cfg = Self { delays, skip };
        if RecoveryAction::LADDER.iter().all(|a| cfg.skips(*a)) {
            return Err("Every recovery rung is configured to skip".into());
        }
        Ok(cfg)
    }

    /// Same delay for every rung.
    pub fn uniform(delay: Duration) -> Self {
        Self {
            delays: [delay; RECOVERY_ORDINAL_COUNT],
            ..Self::default()
        }
    }

    pub fn delay(&self, action: RecoveryAction) -> Duration {
        self.delays[action.ordinal() as usize]
    }

    pub fn skips(&self, action: RecoveryAction) -> bool {
        self.skip[action.ordinal() as usize]
    }

    pub fn with_skip(mut self, action: RecoveryAction, skip: bool) -> Result<Self, String> {
        self.skip[action.ordinal() as usize] = skip;
        Self::new(self.delays, self.skip)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub version: u32,
    pub arbiter: ArbiterConfig,
    pub auto_switch: AutoSwitchConfig,
    pub recovery: RecoveryConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            arbiter: ArbiterConfig::default(),
            auto_switch: AutoSwitchConfig::default(),
            recovery: RecoveryConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl DaemonConfigInput {
    pub fn resolve(self) -> Result<DaemonConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let arbiter_defaults = ArbiterConfig::default();
        let max_data_attach = self
            .arbiter
            .max_data_attach
            .unwrap_or(arbiter_defaults.max_data_attach);
        if max_data_attach == 0 {
            return Err("arbiter.max_data_attach must be at least 1".into());
        }
        let arbiter = ArbiterConfig {
            command_mode: self.arbiter.command_mode,
            max_data_attach,
            modem_retry: self
                .arbiter
                .modem_retry_ms
                .map(Duration::from_millis)
                .unwrap_or(arbiter_defaults.modem_retry),
            emergency_override_timeout: self
                .arbiter
                .emergency_override_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(arbiter_defaults.emergency_override_timeout),
        };

        let auto_defaults = AutoSwitchConfig::default();
        let stability_threshold = match self.auto_switch.stability_threshold_ms {
            Some(ms) if ms < 0 => None,
            Some(ms) => Some(Duration::from_millis(ms as u64)),
            None => auto_defaults.stability_threshold,
        };
        let auto_switch = AutoSwitchConfig {
            stability_threshold,
            retry_interval: self
                .auto_switch
                .retry_interval_ms
                .map(Duration::from_millis)
                .or(stability_threshold)
                .unwrap_or(auto_defaults.retry_interval),
            max_retries: self
                .auto_switch
                .max_retries
                .unwrap_or(auto_defaults.max_retries),
            require_ping_test: self
                .auto_switch
                .require_ping_test
                .unwrap_or(auto_defaults.require_ping_test),
            validation_timeout: self
                .auto_switch
                .validation_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(auto_defaults.validation_timeout),
        };

        let recovery = resolve_recovery(self.recovery)?;

        let metrics_addr = match self.telemetry.metrics_addr.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(addr) => Some(
                addr.parse::<SocketAddr>()
                    .map_err(|e| format!("Invalid telemetry.metrics_addr {addr:?}: {e}"))?,
            ),
        };

        Ok(DaemonConfig {
            version,
            arbiter,
            auto_switch,
            recovery,
            telemetry: TelemetryConfig { metrics_addr },
        })
    }
}

fn resolve_recovery(input: RecoveryConfigInput) -> Result<RecoveryConfig, String> {
    let defaults = RecoveryConfig::default();
    let mut delays = defaults.delays;
    let mut skip = defaults.skip;

    if let Some(list) = input.delays_ms {
        if list.len() > RECOVERY_ORDINAL_COUNT {
            return Err(format!(
                "recovery.delays_ms has {} entries, at most {} allowed",
                list.len(),
                RECOVERY_ORDINAL_COUNT
            ));
        }
        for (slot, ms) in delays.iter_mut().zip(list) {
            *slot = Duration::from_millis(ms);
        }
    }
    if let Some(list) = input.skip {
        if list.len() > RECOVERY_ORDINAL_COUNT {
            return Err(format!(
                "recovery.skip has {} entries, at most {} allowed",
                list.len(),
                RECOVERY_ORDINAL_COUNT
            ));
        }
        for (slot, s) in skip.iter_mut().zip(list) {
            *slot = s;
        }
    }
    RecoveryConfig::new(delays, skip)
}

impl DaemonConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(DaemonConfig::default());
        }
        let parsed: DaemonConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_defaults() {
        let cfg = DaemonConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, DaemonConfig::default());
        assert_eq!(cfg.arbiter.max_data_attach, 1);
        assert_eq!(cfg.auto_switch.max_retries, 7);
        assert!(!cfg.recovery.skips(RecoveryAction::GetDataCallList));
    }

    #[test]
    fn parses_all_sections() {
        let toml = r#"
            version = 1

            [arbiter]
            command_mode = "preferred_data"
            max_data_attach = 2
            modem_retry_ms = 1500

            [auto_switch]
            stability_threshold_ms = 500
            max_retries = 3
            require_ping_test = false

            [recovery]
            delays_ms = [1000, 2000, 0, 3000, 4000]
            skip = [false, true, false, false, false]

            [telemetry]
            metrics_addr = "127.0.0.1:9400"
        "#;
        let cfg = DaemonConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.arbiter.command_mode, Some(CommandMode::PreferredData));
        assert_eq!(cfg.arbiter.max_data_attach, 2);
        assert_eq!(cfg.arbiter.modem_retry, Duration::from_millis(1500));
        assert_eq!(
            cfg.auto_switch.stability_threshold,
            Some(Duration::from_millis(500))
        );
        // retry base follows the stability threshold when unset
        assert_eq!(cfg.auto_switch.retry_interval, Duration::from_millis(500));
        assert!(!cfg.auto_switch.require_ping_test);
        assert_eq!(cfg.recovery.delay(RecoveryAction::Cleanup), Duration::from_secs(2));
        assert_eq!(cfg.recovery.delay(RecoveryAction::RadioRestart), Duration::from_secs(3));
        assert!(cfg.recovery.skips(RecoveryAction::Cleanup));
        assert_eq!(
            cfg.telemetry.metrics_addr,
            Some("127.0.0.1:9400".parse().unwrap())
        );
    }

    #[test]
    fn negative_threshold_disables_auto_switch() {
        let cfg = DaemonConfig::from_toml_str("[auto_switch]\nstability_threshold_ms = -1\n").unwrap();
        assert_eq!(cfg.auto_switch.stability_threshold, None);
    }

    #[test]
    fn reserved_rung_is_always_skipped() {
        let cfg = DaemonConfig::from_toml_str("[recovery]\nskip = [false, false, false, false, false]\n")
            .unwrap();
        assert!(cfg.recovery.skip[RESERVED_REREGISTER_ORDINAL as usize]);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(DaemonConfig::from_toml_str("version = 2").is_err());
        assert!(DaemonConfig::from_toml_str("[arbiter]\nmax_data_attach = 0\n").is_err());
        assert!(DaemonConfig::from_toml_str("[recovery]\nskip = [true, true, true, true, true]\n").is_err());
        assert!(DaemonConfig::from_toml_str("[recovery]\ndelays_ms = [1, 2, 3, 4, 5, 6]\n").is_err());
        assert!(DaemonConfig::from_toml_str("[telemetry]\nmetrics_addr = \"nope\"\n").is_err());
        assert!(DaemonConfig::from_toml_str("this is not toml").is_err());
    }
}
