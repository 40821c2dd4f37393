pub mod codec;
pub mod message;

use std::path::{Path, PathBuf};

use crate::error::Result;

pub const ENV_SOCKET: &str = "MONOMUX_SOCKET";
pub const ENV_SESSION: &str = "MONOMUX_SESSION";

pub fn socket_dir() -> PathBuf {
    let uid = nix::unistd::getuid();
    PathBuf::from(format!("/tmp/monomux-{uid}"))
}

pub fn default_socket_path() -> PathBuf {
    socket_dir().join("default.sock")
}

/// Resolve the socket path: explicit flag, then `MONOMUX_SOCKET`, then the
/// per-user default.
pub fn resolve_socket_path(explicit: Option<&str>) -> PathBuf {
    if let Some(p) = explicit {
        return PathBuf::from(p);
    }
    if let Ok(p) = std::env::var(ENV_SOCKET) {
        if !p.is_empty() {
            return PathBuf::from(p);
        }
    }
    default_socket_path()
}

pub fn ensure_socket_dir(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    Ok(())
}

/// The identity a running session injects into its child environment, read
/// back by in-session control clients (`monomux -d` inside a session).
#[derive(Debug, Clone)]
pub struct SessionEnv {
    pub socket: PathBuf,
    pub session: String,
}

impl SessionEnv {
    pub fn load_from_env() -> Option<Self> {
        let socket = std::env::var(ENV_SOCKET).ok().filter(|s| !s.is_empty())?;
        let session = std::env::var(ENV_SESSION).ok().filter(|s| !s.is_empty())?;
        Some(SessionEnv {
            socket: PathBuf::from(socket),
            session,
        })
    }

    pub fn env_vars(&self) -> Vec<(String, String)> {
        vec![
            (ENV_SOCKET.into(), self.socket.display().to_string()),
            (ENV_SESSION.into(), self.session.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_contains_uid() {
        let path = default_socket_path();
        let uid = nix::unistd::getuid().to_string();
        assert!(path.to_str().unwrap().contains(&uid));
        assert!(path.to_str().unwrap().ends_with("default.sock"));
    }

    #[test]
    fn explicit_path_wins() {
        let p = resolve_socket_path(Some("/tmp/custom.sock"));
        assert_eq!(p, PathBuf::from("/tmp/custom.sock"));
    }

    #[test]
    fn session_env_roundtrip() {
        let env = SessionEnv {
            socket: PathBuf::from("/tmp/m.sock"),
            session: "work".into(),
        };
        let vars = env.env_vars();
        assert!(vars.contains(&(ENV_SOCKET.to_string(), "/tmp/m.sock".to_string())));
        assert!(vars.contains(&(ENV_SESSION.to_string(), "work".to_string())));
    }
}
