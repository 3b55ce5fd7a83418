use config::{Config, Environment, File, Map};
use gapfill_core::config::{ConfigError, FetcherConfig};
use std::path::Path;

/// 环境变量前缀，例如 `GAPFILL_API_KEY`。
const ENV_PREFIX: &str = "GAPFILL";

/// # Summary
/// 加载运行配置。
///
/// # Logic
/// 1. 读取配置文件（不存在时跳过）。
/// 2. 叠加 `GAPFILL_*` 环境变量，`data_types` 与 `symbols` 以逗号分隔。
/// 3. 反序列化为 `FetcherConfig`，缺省字段取默认值。
pub fn load(path: &Path) -> Result<FetcherConfig, ConfigError> {
    load_with_env(path, None)
}

/// 同 `load`，但允许注入环境变量表代替进程环境。
pub fn load_with_env(
    path: &Path,
    env: Option<Map<String, String>>,
) -> Result<FetcherConfig, ConfigError> {
    Config::builder()
        .add_source(File::from(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("data_types")
                .with_list_parse_key("symbols")
                .source(env),
        )
        .build()
        .and_then(|c| c.try_deserialize::<FetcherConfig>())
        .map_err(|e| ConfigError::Load(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gapfill_core::common::DataType;
    use std::io::Write;

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gapfill.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
api_key = "secret"
data_types = ["bars", "trades", "bogus"]
symbols = ["aapl", "msft"]
query_start = "2021-01-04 09:30"
add_bar_tick_count = true
max_concurrency = 8
"#
        )
        .unwrap();

        let config = load_with_env(&path, Some(Map::new())).unwrap();
        assert_eq!(config.api_key, "secret");
        assert_eq!(config.query_start(), Some("2021-01-04 09:30"));
        assert!(config.add_bar_tick_count);
        assert_eq!(config.concurrency_ceiling(4), 8);
        assert_eq!(config.backfill_interval_secs, 30);

        let types = config.validate().unwrap();
        assert_eq!(
            types.into_iter().collect::<Vec<_>>(),
            vec![DataType::Bars, DataType::Trades]
        );
        let allow = config.symbol_allowlist().unwrap();
        assert!(allow.contains("AAPL") && allow.contains("MSFT"));
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gapfill.toml");
        std::fs::write(&path, "api_key = \"from-file\"\ndata_types = [\"bars\"]\n").unwrap();

        let mut env = Map::new();
        env.insert("GAPFILL_API_KEY".into(), "from-env".into());
        env.insert("GAPFILL_DATA_TYPES".into(), "quotes,trades".into());
        env.insert("GAPFILL_BACKFILL_INTERVAL_SECS".into(), "5".into());

        let config = load_with_env(&path, Some(env)).unwrap();
        assert_eq!(config.api_key, "from-env");
        assert_eq!(config.data_types, vec!["quotes", "trades"]);
        assert_eq!(config.backfill_interval_secs, 5);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_with_env(&dir.path().join("absent.toml"), Some(Map::new())).unwrap();
        assert_eq!(config.data_dir, "data");
        assert!(matches!(config.validate(), Err(ConfigError::NoDataType)));
    }
}
