//! # 框架级设置
//!
//! ## 核心意图（Why）
//! - 链组启动的重试节律、默认静默时长等参数原本以字符串属性下发，这里收敛为带类型的结构体，
//!   并显式传入链组启动调用（见 [`ChainStartMode`]）；
//! - 仍接受传统属性键（`chainStartRetryAttempts` 等），便于从扁平属性表装载。
//!
//! ## 行为契约（What）
//! - 非法或越界的取值被忽略：记录 `warn!` 并保留原值；
//! - `serde` 反序列化同时接受 snake_case 字段名与传统属性键。

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

/// 传统属性键：链启动重试次数。
pub const PROPERTY_CHAIN_START_RETRY_ATTEMPTS: &str = "chainStartRetryAttempts";
/// 传统属性键：链启动重试间隔（毫秒）。
pub const PROPERTY_CHAIN_START_RETRY_INTERVAL: &str = "chainStartRetryInterval";
/// 传统属性键：默认静默时长（毫秒）。
pub const PROPERTY_CHAIN_QUIESCE_TIMEOUT: &str = "chainQuiesceTimeout";
/// 传统属性键：缺失配置告警延迟（毫秒）。
pub const PROPERTY_MISSING_CONFIG_WARNING: &str = "warningWaitTime";

const DEFAULT_RETRY_ATTEMPTS: i32 = 60;
const DEFAULT_RETRY_INTERVAL_MS: i64 = 5_000;
const DEFAULT_MISSING_CONFIG_WARNING_MS: i64 = 10_000;

/// 链启动重试策略。
///
/// `max_attempts == None` 表示不限次数。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub interval: Duration,
}

impl RetryPolicy {
    /// 构造有限次数的策略。
    pub fn bounded(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            interval,
        }
    }

    /// 在已尝试 `made` 次后剩余的次数；不限次数时为 `-1`。
    pub fn attempts_left(&self, made: u32) -> i32 {
        match self.max_attempts {
            None => -1,
            Some(max) => i32::try_from(max.saturating_sub(made)).unwrap_or(i32::MAX),
        }
    }
}

/// 链组启动模式。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChainStartMode {
    /// 首个失败即中止，失败链收到 `chain_start_failed(1, 0)`。
    FailEachSilent,
    /// 可重试失败按策略逐链重试，仍失败的链被排除在结果之外。
    RetryEachOnFail(RetryPolicy),
}

/// 框架级设置。
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(from = "RawSettings")]
pub struct FrameworkSettings {
    chain_start_retry_attempts: i32,
    chain_start_retry_interval_ms: i64,
    default_chain_quiesce_timeout_ms: i64,
    missing_config_warning_ms: i64,
}

impl Default for FrameworkSettings {
    fn default() -> Self {
        Self {
            chain_start_retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            chain_start_retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            default_chain_quiesce_timeout_ms: 0,
            missing_config_warning_ms: DEFAULT_MISSING_CONFIG_WARNING_MS,
        }
    }
}

impl FrameworkSettings {
    /// 以传统属性表构造，未出现的键取默认值。
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Self {
        let mut settings = Self::default();
        for (key, value) in properties {
            settings.apply_property(key, value);
        }
        settings
    }

    /// 应用单个传统属性，返回是否被接受。
    pub fn apply_property(&mut self, key: &str, value: &str) -> bool {
        let accepted = match key {
            PROPERTY_CHAIN_START_RETRY_ATTEMPTS => parse(value)
                .and_then(|num| i32::try_from(num).ok())
                .map(|num| self.set_chain_start_retry_attempts(num))
                .unwrap_or(false),
            PROPERTY_CHAIN_START_RETRY_INTERVAL => parse(value)
                .map(|num| self.set_chain_start_retry_interval(num))
                .unwrap_or(false),
            PROPERTY_CHAIN_QUIESCE_TIMEOUT => parse(value)
                .map(|num| self.set_default_chain_quiesce_timeout(num))
                .unwrap_or(false),
            PROPERTY_MISSING_CONFIG_WARNING => parse(value)
                .map(|num| self.set_missing_config_warning(num))
                .unwrap_or(false),
            _ => {
                debug!(key, "ignoring unknown framework property");
                return false;
            }
        };
        if !accepted {
            warn!(key, value, "invalid framework property value ignored");
        }
        accepted
    }

    /// 设置重试次数；`-1` 表示不限，更小的值被拒绝。
    pub fn set_chain_start_retry_attempts(&mut self, attempts: i32) -> bool {
        if attempts < -1 {
            return false;
        }
        self.chain_start_retry_attempts = attempts;
        true
    }

    /// 设置重试间隔（毫秒），负值被拒绝。
    pub fn set_chain_start_retry_interval(&mut self, millis: i64) -> bool {
        if millis < 0 {
            return false;
        }
        self.chain_start_retry_interval_ms = millis;
        true
    }

    /// 设置默认静默时长（毫秒），必须为正。
    pub fn set_default_chain_quiesce_timeout(&mut self, millis: i64) -> bool {
        if millis <= 0 {
            return false;
        }
        self.default_chain_quiesce_timeout_ms = millis;
        true
    }

    /// 设置缺失配置告警延迟（毫秒），负值被拒绝。
    pub fn set_missing_config_warning(&mut self, millis: i64) -> bool {
        if millis < 0 {
            return false;
        }
        self.missing_config_warning_ms = millis;
        true
    }

    /// 重试次数，`-1` 表示不限。
    pub fn chain_start_retry_attempts(&self) -> i32 {
        self.chain_start_retry_attempts
    }

    /// 重试间隔。
    pub fn chain_start_retry_interval(&self) -> Duration {
        millis(self.chain_start_retry_interval_ms)
    }

    /// 默认静默时长（毫秒）。
    pub fn default_chain_quiesce_timeout(&self) -> i64 {
        self.default_chain_quiesce_timeout_ms
    }

    /// 缺失配置告警延迟。
    pub fn missing_config_warning(&self) -> Duration {
        millis(self.missing_config_warning_ms)
    }

    /// 由当前设置导出的重试策略。
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: u32::try_from(self.chain_start_retry_attempts).ok(),
            interval: self.chain_start_retry_interval(),
        }
    }
}

fn parse(value: &str) -> Option<i64> {
    value.trim().parse().ok()
}

fn millis(value: i64) -> Duration {
    Duration::from_millis(u64::try_from(value).unwrap_or(0))
}

#[derive(Deserialize)]
#[serde(default)]
struct RawSettings {
    #[serde(alias = "chainStartRetryAttempts")]
    chain_start_retry_attempts: i32,
    #[serde(alias = "chainStartRetryInterval")]
    chain_start_retry_interval: i64,
    #[serde(alias = "chainQuiesceTimeout")]
    default_chain_quiesce_timeout: i64,
    #[serde(alias = "warningWaitTime")]
    missing_config_warning: i64,
}

impl Default for RawSettings {
    fn default() -> Self {
        let defaults = FrameworkSettings::default();
        Self {
            chain_start_retry_attempts: defaults.chain_start_retry_attempts,
            chain_start_retry_interval: defaults.chain_start_retry_interval_ms,
            default_chain_quiesce_timeout: defaults.default_chain_quiesce_timeout_ms,
            missing_config_warning: defaults.missing_config_warning_ms,
        }
    }
}

impl From<RawSettings> for FrameworkSettings {
    fn from(raw: RawSettings) -> Self {
        let mut settings = FrameworkSettings::default();
        if !settings.set_chain_start_retry_attempts(raw.chain_start_retry_attempts) {
            warn!(value = raw.chain_start_retry_attempts, "chain start retry attempts below -1 ignored");
        }
        if !settings.set_chain_start_retry_interval(raw.chain_start_retry_interval) {
            warn!(value = raw.chain_start_retry_interval, "negative chain start retry interval ignored");
        }
        if raw.default_chain_quiesce_timeout != 0
            && !settings.set_default_chain_quiesce_timeout(raw.default_chain_quiesce_timeout)
        {
            warn!(value = raw.default_chain_quiesce_timeout, "non-positive chain quiesce timeout ignored");
        }
        if !settings.set_missing_config_warning(raw.missing_config_warning) {
            warn!(value = raw.missing_config_warning, "negative missing config warning ignored");
        }
        settings
    }
}
