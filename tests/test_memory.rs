// tests/test_memory.rs — Integration tests for the memory manager, registry
// and dispatcher on the host backend.

use std::sync::Arc;

use ndarray::{arr1, Array2, Array3};

use sepconv::backend::DeviceArg;
use sepconv::host::HostBackend;
use sepconv::{
    normalize, AccessMode, BlockShape, BufferInfo, BufferRegistry, ComputeBackend, DType,
    DeviceArray, Dispatcher, Error, HostArray, KernelArg, MemoryManager,
};

fn setup() -> (Arc<HostBackend>, MemoryManager<HostBackend>) {
    let backend = Arc::new(HostBackend::new());
    let mm = MemoryManager::new(Arc::clone(&backend));
    (backend, mm)
}

// ===== Round trips =====

#[test]
fn round_trip_every_supported_type() {
    let (_, mm) = setup();
    let arrays = [
        HostArray::from(Array2::from_shape_fn((3, 4), |(y, x)| (y * 4 + x) as f32 * 0.5)),
        HostArray::from(Array2::from_shape_fn((3, 4), |(y, x)| (y as f64) - x as f64 / 3.0)),
        HostArray::from(Array3::from_shape_fn((2, 3, 2), |(z, y, x)| (z * 6 + y * 2 + x) as i32 - 5)),
        HostArray::from(arr1(&[i64::from(i32::MIN), -1, 0, 1, i64::from(i32::MAX)])),
        HostArray::from(arr1(&[0u64, 1, 1 << 20])),
    ];
    for src in &arrays {
        let id = mm.to_device(src, None, AccessMode::default()).unwrap();
        let back = mm.fetch(id).unwrap();
        assert_eq!(back, normalize(src).unwrap(), "round trip of {:?}", src.element_type());
    }
}

#[test]
fn round_trip_of_strided_view() {
    let (_, mm) = setup();
    let base = Array2::from_shape_fn((6, 6), |(y, x)| (y * 6 + x) as f32);
    // Every other column: not contiguous.
    let strided = base.clone().slice_move(ndarray::s![.., ..;2]);
    assert!(!strided.is_standard_layout());
    let transposed = HostArray::from(base.reversed_axes());

    let id = mm.to_device(&HostArray::from(strided.clone()), None, AccessMode::default()).unwrap();
    assert_eq!(mm.fetch(id).unwrap().into_f32_array().unwrap(), strided.into_dyn());

    let id = mm.to_device(&transposed, None, AccessMode::default()).unwrap();
    let back = mm.fetch(id).unwrap();
    assert_eq!(back.shape(), &[6, 6]);
    assert_eq!(back.as_f32().unwrap()[1], 6.0);
}

#[test]
fn fetch_with_event_reports_completion() {
    let (_, mm) = setup();
    let id = mm
        .to_device(&HostArray::from(arr1(&[1.0f32, 2.0])), None, AccessMode::default())
        .unwrap();
    let (array, event) = mm.fetch_with_event(id).unwrap();
    assert_eq!(array.as_f32().unwrap(), &[1.0, 2.0]);
    assert!(event.is_complete());
    assert!(event.duration().is_some());
}

#[test]
fn fetch_into_explicit_destination_skips_registry() {
    let (backend, mm) = setup();
    let id = mm
        .to_device(&HostArray::from(arr1(&[1i32, 2, 3, 4])), None, AccessMode::default())
        .unwrap();
    mm.registry().forget(id);
    assert!(matches!(mm.fetch(id), Err(Error::UnknownBuffer(_))));

    // Reinterpret the same bytes with a shape of our choosing.
    let mut dest = DeviceArray::zeros(&[2, 2], DType::I32);
    mm.fetch_into(id, &mut dest).unwrap();
    assert_eq!(dest.into_i32_array().unwrap(), ndarray::arr2(&[[1, 2], [3, 4]]).into_dyn());
    mm.release(id).unwrap();
    assert_eq!(backend.live_buffers(), 0);
}

// ===== Registry book-keeping =====

#[test]
fn most_recent_write_describes_the_buffer() {
    let (_, mm) = setup();
    let id = mm.allocate(&[4, 4], DType::I32, AccessMode::default()).unwrap();
    mm.to_device(&HostArray::from(Array2::<f64>::zeros((2, 8))), Some(id), AccessMode::default())
        .unwrap();
    assert_eq!(mm.registry().lookup(id), Some(BufferInfo::typed(&[2, 8], DType::F32)));
    assert_eq!(mm.fetch(id).unwrap().shape(), &[2, 8]);
}

#[test]
fn managers_sharing_a_registry_see_each_others_buffers() {
    let backend = Arc::new(HostBackend::new());
    let registry = Arc::new(BufferRegistry::new());
    let a = MemoryManager::with_registry(Arc::clone(&backend), Arc::clone(&registry));
    let b = MemoryManager::with_registry(Arc::clone(&backend), Arc::clone(&registry));
    let id = a
        .to_device(&HostArray::from(arr1(&[4.0f32, 5.0])), None, AccessMode::default())
        .unwrap();
    assert_eq!(b.fetch(id).unwrap().as_f32().unwrap(), &[4.0, 5.0]);
    b.release(id).unwrap();
    assert!(registry.is_empty());
    // Already forgotten: warn and carry on.
    a.release(id).unwrap();
}

#[test]
fn release_through_a_manager_with_other_books() {
    let backend = Arc::new(HostBackend::new());
    let a = MemoryManager::new(Arc::clone(&backend));
    let b = MemoryManager::new(Arc::clone(&backend));
    let id = a.allocate(&[16], DType::F32, AccessMode::default()).unwrap();
    b.release(id).unwrap();
    assert_eq!(backend.live_buffers(), 0);
    // `a` still lists it, but the device no longer holds it.
    assert!(matches!(a.release(id), Err(Error::Release { .. })));
}

#[test]
fn independent_managers_keep_separate_books() {
    let (_, a) = setup();
    let (_, b) = setup();
    let id = a.allocate(&[3], DType::F32, AccessMode::default()).unwrap();
    assert!(a.registry().contains(id));
    assert!(!b.registry().contains(id));
}

#[test]
fn concurrent_allocate_and_release() {
    let (backend, mm) = setup();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let mm = mm.clone();
            std::thread::spawn(move || {
                for i in 1..50usize {
                    let id = mm.allocate(&[i], DType::F32, AccessMode::default()).unwrap();
                    if i % 2 == 0 {
                        mm.release(id).unwrap();
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(mm.registry().len(), 4 * 25);
    assert_eq!(backend.live_buffers(), 4 * 25);
}

// ===== Release =====

#[test]
fn release_twice_then_use() {
    let (backend, mm) = setup();
    let id = mm.allocate_zeroed(&[2, 2], DType::F32, AccessMode::default()).unwrap();
    mm.release(id).unwrap();
    mm.release(id).unwrap();
    assert_eq!(backend.live_buffers(), 0);

    let err = mm
        .to_device(&HostArray::from(Array2::<f32>::zeros((2, 2))), Some(id), AccessMode::default())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidHandle(_)));
}

#[test]
fn backend_rejected_release_is_fatal() {
    let (backend, mm) = setup();
    let id = mm.allocate(&[2], DType::F32, AccessMode::default()).unwrap();
    // Freed behind the manager's back: the registry still lists it.
    backend.release(id).unwrap();
    let err = mm.release(id).unwrap_err();
    assert!(matches!(err, Error::Release { .. }));
    assert!(!err.is_validation());
}

// ===== Zeroed allocation =====

#[test]
fn allocate_zeroed_like_matches_reference() {
    let (backend, mm) = setup();
    let reference = HostArray::from(Array3::<f64>::from_elem((2, 3, 4), 9.0));
    let id = mm.allocate_zeroed_like(&reference, AccessMode::default()).unwrap();
    let out = mm.fetch(id).unwrap();
    assert_eq!(out.shape(), &[2, 3, 4]);
    assert!(out.as_f32().unwrap().iter().all(|&v| v == 0.0));
    // One fill on the device, one read back; no host→device copy.
    assert_eq!(backend.transfer_count(), 2);
}

// ===== Dispatcher =====

const PROGRAM: &str = sepconv::CONVOLUTION_PROGRAM;

#[test]
fn dispatcher_rounds_grid_to_block() {
    let (backend, mm) = setup();
    let program = backend.compile(PROGRAM).unwrap();
    let src = mm
        .to_device(&HostArray::from(Array2::<f32>::from_elem((3, 5), 1.0)), None, AccessMode::ReadOnly)
        .unwrap();
    let dst = mm.allocate(&[3, 5], DType::F32, AccessMode::WriteOnly).unwrap();
    let k = mm.to_device(&HostArray::from(arr1(&[1.0f32])), None, AccessMode::ReadOnly).unwrap();

    let dispatcher = Dispatcher::new(Arc::clone(&backend));
    let args = [
        KernelArg::from(src),
        KernelArg::from(dst),
        KernelArg::from(k),
        KernelArg::from(1i64),
        KernelArg::from(5usize),
        KernelArg::from(3usize),
        KernelArg::from(1usize),
    ];
    dispatcher
        .dispatch(&program, "horizontal_convolution", &[5, 3], Some(&BlockShape::Scalar(4)), &args)
        .unwrap();
    dispatcher
        .dispatch(&program, "horizontal_convolution", &[5, 3], None, &args)
        .unwrap();

    let history = backend.dispatch_history();
    assert_eq!(history[0].grid, vec![8, 4]);
    assert_eq!(history[0].block, Some(vec![4, 4]));
    assert_eq!(history[1].grid, vec![5, 3]);
    assert_eq!(history[1].block, None);
    // 64-bit and host-width scalars arrive as i32.
    assert_eq!(history[0].args[3..], [DeviceArg::I32(1), DeviceArg::I32(5), DeviceArg::I32(3), DeviceArg::I32(1)]);

    assert_eq!(mm.fetch(dst).unwrap().as_f32().unwrap(), &[1.0; 15]);
}

#[test]
fn dispatcher_overflow_never_reaches_backend() {
    let (backend, _) = setup();
    let program = backend.compile(PROGRAM).unwrap();
    let dispatcher = Dispatcher::new(Arc::clone(&backend));
    let err = dispatcher
        .dispatch(&program, "horizontal_convolution", &[4], None, &[KernelArg::from(1i64 << 40)])
        .unwrap_err();
    assert!(matches!(err, Error::ScalarOverflow { index: 0, .. }));
    assert_eq!(backend.dispatch_count(), 0);
}

#[test]
fn dispatcher_surfaces_backend_errors() {
    let (backend, _) = setup();
    let program = backend.compile(PROGRAM).unwrap();
    let dispatcher = Dispatcher::new(Arc::clone(&backend));
    let err = dispatcher
        .dispatch(&program, "sharpen", &[4, 4], None, &[])
        .unwrap_err();
    assert!(matches!(err, Error::Dispatch { .. }));
    assert_eq!(backend.dispatch_count(), 1);
}
