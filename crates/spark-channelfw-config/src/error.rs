use spark_channelfw::{ErrorCategory, FrameworkError};
use thiserror::Error;

/// 配置装载错误。
///
/// # 教案式说明
/// - **意图 (Why)**：区分“属性表本身写错了”与“属性表合法但框架拒绝了它”两类问题，
///   前者指向配置作者，后者沿用框架的错误分类；
/// - **契约 (What)**：每个变体都携带出错条目的完整键（例如 `chain.web`），
///   [`category`](Self::category) 对框架错误透传其分类，其余一律为校验错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML 文本无法解析。
    #[error("invalid TOML document: {0}")]
    Toml(#[from] toml::de::Error),

    /// 顶层键不属于任何已知命名空间。
    #[error("unknown configuration key `{key}`; expected one of channel., chain., group., factory., endpoint.")]
    UnknownKey { key: String },

    /// 条目值不是字符串数组。
    #[error("configuration key `{key}` must map to an array of `key=value` strings")]
    NotAnArray { key: String },

    /// 数组元素缺少 `=`。
    #[error("entry `{entry}` under `{key}` is not of the form key=value")]
    MalformedEntry { key: String, entry: String },

    /// 缺少必填属性。
    #[error("`{key}` is missing required attribute `{attribute}`")]
    MissingAttribute {
        key: String,
        attribute: &'static str,
    },

    /// 属性值无法解析。
    #[error("`{key}` has invalid {attribute} `{value}`")]
    InvalidValue {
        key: String,
        attribute: &'static str,
        value: String,
    },

    /// 框架拒绝了该条目。
    #[error("applying `{key}` failed: {source}")]
    Framework {
        key: String,
        #[source]
        source: FrameworkError,
    },
}

impl ConfigError {
    /// 错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            ConfigError::Framework { source, .. } => source.category(),
            _ => ErrorCategory::Validation,
        }
    }

    pub(crate) fn framework(key: &str, source: FrameworkError) -> Self {
        ConfigError::Framework {
            key: key.to_owned(),
            source,
        }
    }
}

/// 配置装载的统一返回类型。
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;
