use tracing::{debug, info, warn};

use super::{ConfigError, UaConfig};
use crate::context::UaContext;
use crate::system::SystemFacade;

/// First line of the generated apt proxy file.
pub const APT_PROXY_HEADER: &str = "// Written by uapro. Edit the [apt] section of uapro.toml instead.";

/// Apt configuration for the configured proxies, `None` when no proxy is
/// set.
#[must_use]
pub fn render_apt_proxy(config: &UaConfig) -> Option<String> {
    if config.apt.http_proxy.is_none() && config.apt.https_proxy.is_none() {
        return None;
    }
    let mut out = format!("{APT_PROXY_HEADER}\n");
    if let Some(proxy) = &config.apt.http_proxy {
        out.push_str(&format!("Acquire::http::Proxy \"{proxy}\";\n"));
    }
    if let Some(proxy) = &config.apt.https_proxy {
        out.push_str(&format!("Acquire::https::Proxy \"{proxy}\";\n"));
    }
    Some(out)
}

/// Reload the configuration file and apply it to the host.
///
/// The file at the context's configuration path is read and validated; on
/// success it replaces the in-memory configuration, the apt proxy file is
/// written or removed to match, and the result is snapshotted as JSON under
/// the data directory. Nothing is changed if loading or validation fails.
///
/// `client.data_dir` is never switched by a reload: the token store and the
/// host lock already live under the current directory, so a different value
/// is logged and ignored until the next invocation.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed or validated,
/// or a derived file cannot be written.
pub fn process_config(ctx: &mut UaContext) -> Result<(), ConfigError> {
    let mut config = match &ctx.config_path {
        Some(path) => match ctx.system.read_file(path)? {
            Some(content) => UaConfig::from_toml(&content)?,
            None => {
                debug!(path = %path.display(), "configuration file missing, using defaults");
                UaConfig::default()
            },
        },
        None => ctx.config.clone(),
    };
    config.validate()?;
    if config.client.data_dir != ctx.config.client.data_dir {
        warn!(
            current = %ctx.config.client.data_dir.display(),
            requested = %config.client.data_dir.display(),
            "data_dir changes take effect on the next invocation"
        );
        config.client.data_dir.clone_from(&ctx.config.client.data_dir);
    }

    apply_apt_proxy(ctx.system.as_ref(), &config)?;

    let snapshot = serde_json::to_vec_pretty(&config)?;
    ctx.system
        .write_file(&config.effective_config_path(), &snapshot, 0o644)?;

    info!(data_dir = %config.client.data_dir.display(), "configuration processed");
    ctx.config = config;
    Ok(())
}

fn apply_apt_proxy(system: &dyn SystemFacade, config: &UaConfig) -> Result<(), ConfigError> {
    let path = &config.apt.proxy_conf_path;
    match render_apt_proxy(config) {
        Some(content) => {
            system.write_file(path, content.as_bytes(), 0o644)?;
            info!(path = %path.display(), "wrote apt proxy configuration");
        },
        None => {
            if system.remove_file_if_exists(path)? {
                info!(path = %path.display(), "removed apt proxy configuration");
            }
        },
    }
    Ok(())
}
