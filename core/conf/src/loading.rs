//! Load configuration from files.
use std::fs::File;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;

use crate::Conf;

/// Errors handling tributary configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unable to decode configuration from file at the given path.
    #[error("unable to decode configuration from file at '{0}'")]
    // (path,)
    Decode(String),

    /// Unable to read configuration file at the given path.
    #[error("unable to read configuration file at '{0}'")]
    // (path,)
    Open(String),

    /// Configuration file not found at the given path.
    #[error("configuration file not found at '{0}'")]
    // (path,)
    PathNotFound(String),
}

/// Load process configuration from the specified path.
///
/// Unknown keys are rejected at decode time so typos surface before the
/// process starts rather than silently applying defaults.
pub fn load(path: &str) -> Result<Conf> {
    if !PathBuf::from(path).exists() {
        let error = Error::PathNotFound(path.to_string());
        return Err(anyhow::anyhow!(error));
    }
    let file = File::open(path).with_context(|| Error::Open(path.into()))?;
    let conf = serde_yaml::from_reader(file).with_context(|| Error::Decode(path.into()))?;
    Ok(conf)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::load;
    use super::Error;
    use crate::SyncMode;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_path_is_reported() {
        let error = load("/no/such/tributary.yaml").unwrap_err();
        let error = error.downcast::<Error>().unwrap();
        assert!(matches!(error, Error::PathNotFound(_)));
    }

    #[test]
    fn minimal_conf_loads() {
        let file = write_temp("name: plane\nmode: hybrid\n");
        let conf = load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(conf.name, "plane");
        assert_eq!(conf.mode, SyncMode::Hybrid);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_temp("name: plane\nmode: hybrid\nsurprise: true\n");
        let error = load(file.path().to_str().unwrap()).unwrap_err();
        let chain = format!("{:#}", error);
        assert!(chain.contains("unable to decode configuration"));
    }
}
