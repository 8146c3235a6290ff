use residency_rs::{
    Context, ResidencyConfig, SimulatedDevice, TrimFlags, TrimNotification,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const BUDGET: u64 = 16 * 4096;
const ALLOCATION_SIZE: u64 = 4 * 4096;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("============================================================");
    println!("          Residency Controller - Trim Under Pressure        ");
    println!("============================================================");

    // 1. Device with a small resident budget
    let device = Arc::new(SimulatedDevice::with_budget(BUDGET));
    let config = ResidencyConfig::from_toml_str("residency_logging = true")?;
    let context = Context::new(device.clone(), config);
    let engine = context.create_engine_context()?;
    let controller = engine.residency_controller();
    println!("[+] Engine context {} (budget {} KiB)", engine.id(), BUDGET / 1024);

    // 2. Submit more work than fits, one allocation per submission
    let manager = context.memory_manager();
    let mut allocations = Vec::new();
    for i in 0..8 {
        let allocation = manager.allocate(ALLOCATION_SIZE)?;
        controller.make_resident_residency_allocations(&[allocation.clone()])?;
        let submitted = controller.record_submission();
        controller.fence_completion().signal(submitted);
        controller.make_non_resident_eviction_allocations(&[allocation.clone()]);

        println!(
            "    submission {:>2}: {} resident, {} KiB on device, budget exhausted: {}",
            i + 1,
            allocation.id(),
            device.resident_bytes() / 1024,
            controller.is_memory_budget_exhausted()
        );
        allocations.push(allocation);
    }

    // 3. The OS asks for a periodic trim after marking a new watermark
    println!("[+] Restarting periodic trim watermark...");
    device.signal_trim(TrimNotification {
        flags: TrimFlags::new().restart_periodic_trim(),
        num_bytes_to_trim: 0,
    });
    let fresh = manager.allocate(ALLOCATION_SIZE)?;
    controller.make_resident_residency_allocations(&[fresh.clone()])?;
    controller.record_submission();
    controller.make_non_resident_eviction_allocations(&[fresh.clone()]);

    println!("[+] Periodic trim...");
    device.signal_trim(TrimNotification {
        flags: TrimFlags::new().periodic_trim(),
        num_bytes_to_trim: 0,
    });
    println!(
        "    {} candidates left, {} KiB on device",
        controller.trim_candidate_count(),
        device.resident_bytes() / 1024
    );

    // 4. Free everything; the unfinished submission is waited on first
    println!("[+] Freeing allocations...");
    for allocation in allocations.iter().chain(std::iter::once(&fresh)) {
        manager.free(allocation)?;
    }

    let stats = controller.stats();
    println!("------------------------------------------------------------");
    println!("    lock acquisitions:     {}", stats.lock_acquisitions);
    println!("    trim passes:           {}", stats.trim_passes);
    println!("    evicted handles:       {}", stats.evicted_handles);
    println!("    evicted bytes:         {}", stats.evicted_bytes);
    println!("    make resident retries: {}", stats.make_resident_retries);
    println!("    device allocations:    {}", device.live_allocation_count());

    Ok(())
}
