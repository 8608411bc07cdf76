use std::path::PathBuf;

/// Consumer socket port.
pub const MEDIATOR_TCP_PORT: u16 = 48160;
/// Port of the local enhancement backend.
pub const BACKEND_PORT: u16 = 48159;

const APP_DIR: &str = "manga-upscaler";

pub fn backend_base_url() -> String {
    format!("http://127.0.0.1:{}", BACKEND_PORT)
}

pub fn data_dir() -> PathBuf {
    // ~/.local/share/<app>/ on every unix, macOS included.
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        // Portable install: a `data/` folder beside the executable wins.
        if let Some(dir) = exe_dir() {
            let portable_data = dir.join("data");
            if portable_data.exists() {
                return portable_data;
            }
        }

        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    // Portable install: a config.toml beside the executable wins.
    #[cfg(windows)]
    {
        if let Some(dir) = exe_dir() {
            if dir.join("config.toml").exists() {
                return dir;
            }
        }
    }

    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

fn exe_dir() -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    current_exe.parent().map(|p| p.to_path_buf())
}

#[cfg(unix)]
fn host_binary_names() -> &'static [&'static str] {
    &["manga-upscaler-host", "native_messaging_host"]
}

#[cfg(windows)]
fn host_binary_names() -> &'static [&'static str] {
    &["MangaUpscalerNativeHost.exe", "native_messaging_host.exe"]
}

fn find_beside_exe(names: &[&str]) -> Option<PathBuf> {
    let dir = exe_dir()?;
    for name in names {
        let p = dir.join(name);
        if p.exists() {
            return Some(p);
        }
        let p = dir.join("native_host").join(name);
        if p.exists() {
            return Some(p);
        }
    }
    None
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var("PATH").ok()?;
    #[cfg(unix)]
    let sep = ":";
    #[cfg(windows)]
    let sep = ";";
    for dir in path.split(sep) {
        for name in names {
            let p = PathBuf::from(dir).join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}

/// Find the native-messaging host (process supervisor).
///
/// Searches in order:
/// 1. MU_HOST_PATH environment variable
/// 2. Beside the current executable (or its `native_host/` folder)
/// 3. PATH
pub fn find_host_binary() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("MU_HOST_PATH") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }
    if let Some(p) = find_beside_exe(host_binary_names()) {
        return Some(p);
    }
    find_on_path(host_binary_names())
}
