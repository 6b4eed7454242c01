//! Environment variable configuration source.
//!
//! Every [`RawConfig`] field can be set through a `PYROSCOPE_`-prefixed variable whose
//! suffix is the field name in any case, for example:
//!
//! ```text
//! PYROSCOPE_APPLICATION_NAME=checkout
//! PYROSCOPE_SERVER_ADDRESS=https://profiles.example.com
//! PYROSCOPE_SAMPLE_RATE=250
//! PYROSCOPE_DETECT_SUBPROCESSES=true
//! PYROSCOPE_LOG_LEVEL=debug
//! PYROSCOPE_TAGS=region=us-east,az=1b
//! PYROSCOPE_HTTP_HEADERS={"X-Scope-OrgID":"team-a"}
//! ```
//!
//! Values are loaded through figment, so numbers and booleans are parsed from their
//! textual form. Unrecognized `PYROSCOPE_*` variables are ignored.

use figment::{providers::Env, Figment};

use crate::config::{ConfigError, ConfigSource, RawConfig};

pub const ENV_PREFIX: &str = "PYROSCOPE_";

#[derive(Debug, Clone, Copy, Default)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut RawConfig) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<RawConfig>() {
            Ok(env_config) => config.merge_from(&env_config),
            Err(e) => {
                return Err(ConfigError::ParseError(format!(
                    "Failed to parse config from environment variables: {e}, ignoring them."
                )));
            }
        }

        Ok(())
    }
}
