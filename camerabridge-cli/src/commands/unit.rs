//! Unit command - print a systemd user unit for the daemon

use anyhow::{Context, Result};

use super::GlobalArgs;

/// Print a systemd user unit running `camerabridge run --enable`
///
/// Install with:
/// `camerabridge unit > ~/.config/systemd/user/camerabridge.service`
pub fn unit(global: &GlobalArgs) -> Result<u8> {
    let exe = std::env::current_exe().context("Failed to locate camerabridge binary")?;
    let mut exec_start = format!("{} run --enable", exe.display());
    if let Some(config) = &global.config {
        exec_start.push_str(&format!(" --config {}", config.display()));
    }

    print!("{}", render_unit(&exec_start));
    Ok(0)
}

fn render_unit(exec_start: &str) -> String {
    format!(
        r#"[Unit]
Description=camerabridge virtual camera bridge
After=graphical-session.target
PartOf=graphical-session.target

[Service]
Type=simple
ExecStart={exec_start}
Restart=on-failure
RestartSec=5
# Exit codes 1 (invalid configuration) and 2 (facility unavailable) are not
# fixed by restarting
RestartPreventExitStatus=1 2

[Install]
WantedBy=graphical-session.target
"#
    )
}
