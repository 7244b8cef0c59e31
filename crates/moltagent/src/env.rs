//! Process environment and mode selection.

use std::path::PathBuf;

/// Default standalone control-plane port.
pub const DEFAULT_CP_PORT: u16 = 18790;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Worker,
    Orchestrator,
    Hybrid,
    Unconfigured,
}

/// Environment-derived runtime settings.
#[derive(Debug, Clone)]
pub struct RuntimeEnv {
    /// `MOLTAGENT_MANIFEST`: path to the worker manifest; presence selects
    /// worker mode.
    pub manifest_path: Option<PathBuf>,
    /// `MOLTAGENT_CONTROL_PLANE=1`.
    pub control_plane_flag: bool,
    /// `MOLTAGENT_API_TOKEN`: the shared bearer token; presence also
    /// selects orchestrator mode.
    pub api_token: Option<String>,
    /// `MOLTAGENT_DATA_DIR`: override for the fleet-file directory.
    pub data_dir: PathBuf,
    /// `MOLTAGENT_CP_PORT`, default 18790.
    pub cp_port: u16,
}

impl RuntimeEnv {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Self {
        let manifest_path = get("MOLTAGENT_MANIFEST")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let control_plane_flag = get("MOLTAGENT_CONTROL_PLANE").as_deref() == Some("1");
        let api_token = get("MOLTAGENT_API_TOKEN").filter(|v| !v.is_empty());
        let data_dir = get("MOLTAGENT_DATA_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".moltagent")
            });
        let cp_port = get("MOLTAGENT_CP_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CP_PORT);

        Self {
            manifest_path,
            control_plane_flag,
            api_token,
            data_dir,
            cp_port,
        }
    }

    pub fn mode(&self) -> Mode {
        let worker = self.manifest_path.is_some();
        let orchestrator = self.control_plane_flag || self.api_token.is_some();
        match (worker, orchestrator) {
            (true, true) => Mode::Hybrid,
            (true, false) => Mode::Worker,
            (false, true) => Mode::Orchestrator,
            (false, false) => Mode::Unconfigured,
        }
    }

    /// Base URL of the local orchestrator's HTTP surface.
    pub fn api_base(&self) -> String {
        format!("http://localhost:{}/moltagent", self.cp_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> RuntimeEnv {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RuntimeEnv::from_vars(|key| map.get(key).cloned())
    }

    #[test]
    fn unconfigured_by_default() {
        assert_eq!(env(&[]).mode(), Mode::Unconfigured);
    }

    #[test]
    fn manifest_selects_worker_mode() {
        let e = env(&[("MOLTAGENT_MANIFEST", "/opt/moltagent/manifest.json")]);
        assert_eq!(e.mode(), Mode::Worker);
    }

    #[test]
    fn token_or_flag_selects_orchestrator_mode() {
        assert_eq!(env(&[("MOLTAGENT_API_TOKEN", "T")]).mode(), Mode::Orchestrator);
        assert_eq!(
            env(&[("MOLTAGENT_CONTROL_PLANE", "1")]).mode(),
            Mode::Orchestrator
        );
        assert_eq!(
            env(&[("MOLTAGENT_CONTROL_PLANE", "0")]).mode(),
            Mode::Unconfigured
        );
    }

    #[test]
    fn both_selects_hybrid() {
        let e = env(&[
            ("MOLTAGENT_MANIFEST", "/m.json"),
            ("MOLTAGENT_API_TOKEN", "T"),
        ]);
        assert_eq!(e.mode(), Mode::Hybrid);
    }

    #[test]
    fn port_defaults_and_overrides() {
        assert_eq!(env(&[]).cp_port, DEFAULT_CP_PORT);
        assert_eq!(env(&[("MOLTAGENT_CP_PORT", "9100")]).cp_port, 9100);
        assert_eq!(env(&[("MOLTAGENT_CP_PORT", "junk")]).cp_port, DEFAULT_CP_PORT);
        assert_eq!(
            env(&[("MOLTAGENT_CP_PORT", "9100")]).api_base(),
            "http://localhost:9100/moltagent"
        );
    }

    #[test]
    fn data_dir_override() {
        let e = env(&[("MOLTAGENT_DATA_DIR", "/var/lib/moltagent")]);
        assert_eq!(e.data_dir, PathBuf::from("/var/lib/moltagent"));
    }
}
