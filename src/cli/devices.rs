//! Device listing command

use anyhow::Result;

use crate::device::{DevicePool, DeviceProbe, SystemProbe, DEVICES_ENV};

fn gib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

/// Print the probed inventory and, with `spec`, what it resolves to
pub fn devices(spec: Option<String>) -> Result<()> {
    let probe = SystemProbe;
    let inventory = probe.probe();

    println!("Devices (accelerators from {}):", DEVICES_ENV);
    for device in &inventory {
        println!(
            "  {:<8} {:>8.2} GiB total  {:>8.2} GiB free",
            device.id.to_string(),
            gib(device.total_memory),
            gib(device.free_memory)
        );
    }

    if let Some(spec) = spec {
        let pool = DevicePool::from_spec(&spec, &probe)?;
        let bound: Vec<String> = pool.ids().iter().map(ToString::to_string).collect();
        println!("\n'{}' resolves to: {}", spec, bound.join(", "));
    }

    Ok(())
}
