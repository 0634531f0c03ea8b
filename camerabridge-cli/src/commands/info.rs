//! Info command - check the system for everything the bridge needs

use anyhow::Result;
use camerabridge_core::env::detect;
use camerabridge_core::ipc::daemon_running;

use super::GlobalArgs;

/// Show system information
pub async fn info(global: &GlobalArgs) -> Result<u8> {
    let config = global.load_config()?;
    let report = detect(&config.tools);

    println!("camerabridge - System Information\n");

    let ok = |present: bool| if present { "[OK]" } else { "[!!]" };

    println!("Virtual Device:");
    println!("  {} v4l2loopback module loaded", ok(report.loopback_module));
    match &report.loopback_ctl {
        Some(path) => println!("  [OK] {}", path.display()),
        None => println!("  [!!] {} not found", config.tools.loopback_ctl),
    }
    println!();

    println!("Capture Pipeline:");
    match &report.gst_launch {
        Some(path) => println!("  [OK] {}", path.display()),
        None => println!("  [!!] {} not found", config.tools.gst_launch),
    }
    println!(
        "  {} source element {}",
        ok(report.source_element_installed),
        report.source_element
    );
    println!();

    println!("Session:");
    println!("  Desktop:     {}", report.desktop);
    println!(
        "  {} session bus{}",
        ok(report.session_bus.is_some()),
        report
            .session_bus
            .as_deref()
            .map(|addr| format!(" ({})", addr))
            .unwrap_or_default()
    );
    let socket = global.socket_path();
    let running = daemon_running(&socket).await;
    println!(
        "  Daemon:      {} ({})",
        if running { "running" } else { "not running" },
        socket.display()
    );
    println!();

    println!("Capture Devices:");
    if report.capture_devices.is_empty() {
        println!("  (none)");
    }
    for device in &report.capture_devices {
        println!(
            "  /dev/video{:<3} {:<32} {}",
            device.index,
            device.label,
            if device.is_virtual { "virtual" } else { "physical" }
        );
    }
    if let Some(device) = report.physical_device_at(config.device.index) {
        println!();
        println!(
            "  [!!] Configured index {} is used by physical device \"{}\"; choose another index",
            config.device.index, device.label
        );
    }

    let problems = report.problems();
    println!();
    if problems.is_empty() {
        println!("Everything needed is in place.");
    } else {
        println!("Problems:");
        for problem in &problems {
            println!("  - {}", problem);
        }
    }

    Ok(0)
}
