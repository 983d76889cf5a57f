//! Lifecycle of an Ollama server owned by this process.

use anyhow::{anyhow, Result};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Locate an `ollama` binary: next to the executable first, then on PATH.
pub fn find_ollama_binary() -> Option<PathBuf> {
    let name = if cfg!(windows) { "ollama.exe" } else { "ollama" };

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let candidate = exe_dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    // Linux AppImage: APPDIR/usr/bin/ollama
    if let Ok(appdir) = std::env::var("APPDIR") {
        let candidate = PathBuf::from(appdir).join("usr/bin").join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    if Command::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
    {
        Some(PathBuf::from(name))
    } else {
        None
    }
}

/// `host:port` of a base URL such as `http://127.0.0.1:11434`.
pub(crate) fn host_port(base: &str) -> Option<String> {
    let url = url::Url::parse(base).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{}:{}", host, port))
}

/// Check if something is listening at `base`.
pub fn reachable(base: &str) -> bool {
    let Some(addr) = host_port(base)
        .and_then(|hp| hp.to_socket_addrs().ok())
        .and_then(|mut addrs| addrs.next())
    else {
        return false;
    };
    TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok()
}

/// Poll until `base` is reachable or timeout (in seconds).
fn wait_for(base: &str, timeout_secs: u32) -> bool {
    for _ in 0..(timeout_secs * 4) {
        if reachable(base) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(250));
    }
    false
}

/// Start `binary serve` bound to the address of `base`.
pub fn start(binary: &Path, base: &str) -> Result<Child> {
    let host = host_port(base).ok_or_else(|| anyhow!("invalid ollama url: {}", base))?;
    let mut child = Command::new(binary)
        .arg("serve")
        .env("OLLAMA_HOST", &host)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| anyhow!("Failed to start Ollama: {}", e))?;

    if wait_for(base, 8) {
        tracing::info!("Started ollama server on {}", host);
        Ok(child)
    } else {
        let _ = child.kill();
        let _ = child.wait();
        Err(anyhow!(
            "Ollama started but didn't become reachable within 8 seconds"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_host_port() {
        assert_eq!(
            host_port("http://127.0.0.1:11434").as_deref(),
            Some("127.0.0.1:11434")
        );
        assert_eq!(
            host_port("http://localhost").as_deref(),
            Some("localhost:80")
        );
        assert_eq!(host_port("not a url"), None);
    }

    #[test]
    fn test_reachable_sees_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(reachable(&format!("http://127.0.0.1:{}", port)));

        drop(listener);
        assert!(!reachable("http://127.0.0.1:1"));
    }
}
