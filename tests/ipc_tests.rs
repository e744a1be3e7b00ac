//! Export and import of allocations between "processes" sharing one device.

mod common;

use common::{buffer, context, manager};
use drm_residency::{
    AllocationProperties, AllocationType, DeviceBitfield, DrmError, ImportFlags, IpcDescriptor,
    IpcExchange, IpcMemoryType, MemoryPool,
};
use drm_residency::memory::CachePolicy;

#[test]
fn two_tile_allocation_round_trips_through_descriptors() {
    let (drm, mm) = manager(true, 2);
    let (ctx, _) = context(&mm, 0, DeviceBitfield::all(2));
    let exchange = IpcExchange::new(mm.clone());

    let exported = mm.allocate(&buffer(DeviceBitfield::all(2))).unwrap();
    let descriptors = exchange
        .get_ipc_handles(&exported, IpcMemoryType::Device)
        .unwrap();
    assert_eq!(descriptors.len(), 2);
    for (index, d) in descriptors.iter().enumerate() {
        assert_eq!(d.header.tile_count, 2);
        assert_eq!(usize::from(d.header.tile_index), index);
        assert_eq!(d.memory_type().unwrap(), IpcMemoryType::Device);
    }

    // Descriptors travel as bytes.
    let wire: Vec<_> = descriptors.iter().map(IpcDescriptor::to_bytes).collect();
    let received: Vec<_> = wire
        .iter()
        .map(|bytes| IpcDescriptor::from_bytes(bytes).unwrap())
        .collect();

    let imported = exchange
        .open_ipc_handles(&received, IpcMemoryType::Device, ImportFlags::default(), &ctx)
        .unwrap();
    assert_eq!(imported.import_tag(), Some(1));
    assert_eq!(imported.num_handles(), 2);
    assert_eq!(imported.kernel_handles(), exported.kernel_handles());
    assert_eq!(imported.allocation_type(), AllocationType::SharedBuffer);
    assert!(imported.is_bound_on_tile(&ctx, 0));
    assert!(imported.is_bound_on_tile(&ctx, 1));
    assert_eq!(drm.binds(), 2);

    // The exporter still owns the memory.
    exchange.close_ipc_handle(imported).unwrap();
    assert!(drm.closed_handles().is_empty());
    assert_eq!(drm.unbinds(), 2);

    mm.free(exported).unwrap();
    assert_eq!(drm.closed_handles(), vec![1, 2]);
    let closed_fds = drm.state.lock().closed_fds.clone();
    assert_eq!(closed_fds.len(), 2);
}

#[test]
fn failed_export_returns_no_descriptors() {
    let (drm, mm) = manager(true, 2);
    let exchange = IpcExchange::new(mm.clone());
    let alloc = mm.allocate(&buffer(DeviceBitfield::all(2))).unwrap();

    drm.state.lock().fail_export_at = Some((1, libc::EMFILE));
    let result = exchange.get_ipc_handles(&alloc, IpcMemoryType::Device);
    assert!(matches!(result, Err(DrmError::OutOfHostMemory)));

    // The descriptor created for tile 0 was closed again.
    assert_eq!(drm.state.lock().closed_fds, vec![200]);
    assert!(alloc.take_exported_fds().is_empty());
}

#[test]
fn shared_descriptor_cannot_open_as_device_memory() {
    let (_drm, mm) = manager(true, 1);
    let (ctx, _) = context(&mm, 0, DeviceBitfield::single(0));
    let exchange = IpcExchange::new(mm.clone());
    let alloc = mm.allocate(&buffer(DeviceBitfield::single(0))).unwrap();

    let descriptor = exchange.get_ipc_handle(&alloc, IpcMemoryType::Shared).unwrap();
    let result = exchange.open_ipc_handle(&descriptor, IpcMemoryType::Device, ImportFlags::default(), &ctx);
    assert!(matches!(result, Err(DrmError::InvalidArgument(_))));
    assert_eq!(exchange.import_count(), 0);
}

#[test]
fn host_memory_imports_uncached() {
    let (_drm, mm) = manager(false, 1);
    let (ctx, _) = context(&mm, 0, DeviceBitfield::single(0));
    let exchange = IpcExchange::new(mm.clone());
    let host = mm
        .allocate(&AllocationProperties::new(0, 0x2000, AllocationType::BufferHostMemory).host_ptr(0x7f00_0000_0000))
        .unwrap();

    let descriptor = exchange.get_ipc_handle(&host, IpcMemoryType::Host).unwrap();
    let imported = exchange
        .open_ipc_handle(&descriptor, IpcMemoryType::Host, ImportFlags { uncached: true }, &ctx)
        .unwrap();
    assert_eq!(imported.memory_pool(), MemoryPool::System4KBPages);
    let bo = imported.bo_for_tile(0).unwrap();
    assert_eq!(bo.cache_policy(), CachePolicy::Uncached);
    assert!(imported.is_bound_in(&ctx));
}

#[test]
fn multi_handle_allocation_needs_the_batch_export() {
    let (_drm, mm) = manager(true, 2);
    let exchange = IpcExchange::new(mm.clone());
    let alloc = mm.allocate(&buffer(DeviceBitfield::all(2))).unwrap();
    assert!(matches!(
        exchange.get_ipc_handle(&alloc, IpcMemoryType::Device),
        Err(DrmError::InvalidArgument(_))
    ));
}

#[test]
fn unknown_descriptor_fails_to_import() {
    let (_drm, mm) = manager(true, 1);
    let (ctx, _) = context(&mm, 0, DeviceBitfield::single(0));
    let exchange = IpcExchange::new(mm.clone());
    let alloc = mm.allocate(&buffer(DeviceBitfield::single(0))).unwrap();

    let mut descriptor = exchange.get_ipc_handle(&alloc, IpcMemoryType::Device).unwrap();
    descriptor.handle = 9999;
    assert!(
        exchange
            .open_ipc_handle(&descriptor, IpcMemoryType::Device, ImportFlags::default(), &ctx)
            .is_err()
    );
}

#[test]
fn handle_closes_once_the_last_surviving_reference_drops() {
    let (drm, mm) = manager(true, 1);
    let (ctx, _) = context(&mm, 0, DeviceBitfield::single(0));
    let exchange = IpcExchange::new(mm.clone());

    let exported = mm.allocate(&buffer(DeviceBitfield::single(0))).unwrap();
    let descriptor = exchange.get_ipc_handle(&exported, IpcMemoryType::Device).unwrap();
    let imported = exchange
        .open_ipc_handle(&descriptor, IpcMemoryType::Device, ImportFlags::default(), &ctx)
        .unwrap();
    let still_listed = imported.clone();

    exchange.close_ipc_handle(imported).unwrap();
    mm.free(exported).unwrap();
    assert!(drm.closed_handles().is_empty());

    drop(still_listed);
    assert_eq!(drm.closed_handles(), vec![1]);
}
