use drm_residency::logging::init_logging;
use drm_residency::memory::EvictUnused;
use drm_residency::{
    AllocationProperties, AllocationType, DeviceBitfield, DrmDevice, DrmInterface,
    DrmMemoryManager, IpcExchange, IpcMemoryType, OsContext, ResidencyConfig, TaskCountEngine,
};
use std::error::Error;
use std::sync::Arc;

fn main() -> Result<(), Box<dyn Error>> {
    init_logging()?;

    println!("============================================================");
    println!("                  DRM Residency Report                      ");
    println!("============================================================");

    println!("[+] Opening render node...");
    let device = match DrmDevice::open() {
        Ok(dev) => dev,
        Err(e) => {
            eprintln!("[-] Failed to open render node: {}", e);
            eprintln!("    (Ensure the i915/xe driver is loaded and you are in the 'render' group)");
            return Err(e.into());
        }
    };
    println!("    VM bind available: {}", device.is_vm_bind_available());

    let config = ResidencyConfig::from_env();
    println!("    Config:            {:?}", config);

    let manager = Arc::new(DrmMemoryManager::new(Arc::new(device), config));
    let tiles = DeviceBitfield::all(manager.config().sub_device_count);

    // The demo drives completion by hand; a real front end feeds it from fences.
    let engine = Arc::new(TaskCountEngine::new());
    let ctx = Arc::new(OsContext::new(0, tiles, engine.clone())?);
    manager.register_engine(ctx.clone())?;

    println!("\n[+] Allocating buffers across {} tile(s)...", tiles.count());
    let scratch = manager.allocate(
        &AllocationProperties::new(0, 2 * 1024 * 1024, AllocationType::Buffer).tile_mask(tiles),
    )?;
    let isa = manager.allocate(&AllocationProperties::new(0, 64 * 1024, AllocationType::KernelIsa))?;

    manager.lock(&isa)?;
    manager
        .handler()
        .make_resident_within_os_context(&ctx, &[scratch.clone()], true)?;

    for alloc in [&scratch, &isa] {
        println!(
            "  - #{:<3} {:<12} {:#014x} {:>8} KB  handles {:?}  {:?}{}",
            alloc.id(),
            format!("{:?}", alloc.allocation_type()),
            alloc.gpu_address(),
            alloc.size() / 1024,
            alloc.kernel_handles(),
            alloc.residency_state(&ctx),
            if manager.is_resident(alloc) { " (pinned)" } else { "" },
        );
    }

    let resident = manager.ensure_resident_set(&ctx)?;
    println!("    Resident set for context 0: {} allocation(s)", resident.len());

    println!("\n[+] Retiring work and sweeping...");
    let task = engine.submit();
    engine.complete(task);
    manager.handler().evict_unused_allocations(false)?;
    println!("    scratch bound: {}", scratch.is_bound_in(&ctx));
    println!("    isa bound:     {}", isa.is_bound_in(&ctx));

    println!("\n[+] Exporting scratch buffer...");
    let exchange = IpcExchange::new(manager.clone());
    match exchange.get_ipc_handles(&scratch, IpcMemoryType::Device) {
        Ok(descriptors) => {
            for d in &descriptors {
                println!(
                    "  - tile {}/{}  fd {}  {} bytes",
                    d.header.tile_index, d.header.tile_count, d.fd(), d.size
                );
            }
        }
        Err(e) => eprintln!("[-] Export failed: {}", e),
    }

    manager.unlock(&isa);
    manager.free(scratch)?;
    manager.free(isa)?;
    println!("\n[+] Done.");
    Ok(())
}
