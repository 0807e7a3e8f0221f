use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use accelport_burst::{
    create_burst_with_capacity, BurstServer, ExecutionBurstController, RequestDatum, ResultDatum,
    RingChannel, SendStatus, DEFAULT_POLLING_WINDOW,
};
use accelport_core::{
    ArgumentLifetime, DataLocation, Dimensions, ErrorStatus, OutputShape, RequestArgument, Timing,
};
use accelport_memory::{MemoryId, MemoryObject, Request, RequestPool};

fn pool_argument(pool: u32, length: u32, dims: &[u32]) -> RequestArgument {
    RequestArgument {
        lifetime: ArgumentLifetime::Pool,
        location: DataLocation {
            pool,
            offset: 0,
            length,
        },
        dimensions: Dimensions::from_slice(dims),
    }
}

#[test]
fn empty_request_round_trips() {
    let (controller, server) = create_burst_with_capacity(DEFAULT_POLLING_WINDOW, 64);
    assert_eq!(controller.send(&Request::default(), false), SendStatus::Sent);

    let (request, memories, measure) = server.wait_request().unwrap();
    assert!(request.inputs.is_empty());
    assert!(request.outputs.is_empty());
    assert!(memories.is_empty());
    assert!(!measure);

    assert!(server.send_result(ErrorStatus::None, &[], Timing::NONE));
    let (status, shapes, timing) = controller.receive().unwrap();
    assert_eq!(status, ErrorStatus::None);
    assert!(shapes.is_empty());
    assert_eq!(timing, Timing::NONE);
}

#[test]
fn typical_request_round_trips() {
    let (controller, server) = create_burst_with_capacity(DEFAULT_POLLING_WINDOW, 256);
    let input_pool = MemoryObject::new_shared(24);
    let output_pool = MemoryObject::new_shared(24);
    let request = Request {
        inputs: vec![
            pool_argument(0, 24, &[2, 3]),
            RequestArgument::no_value(),
        ],
        outputs: vec![pool_argument(1, 24, &[2, 3])],
        pools: vec![
            RequestPool::Memory(input_pool.clone()),
            RequestPool::Memory(output_pool.clone()),
        ],
    };
    assert_eq!(controller.send(&request, true), SendStatus::Sent);

    let (burst, memories, measure) = server.wait_request().unwrap();
    assert_eq!(burst.inputs.len(), 2);
    assert!(burst.inputs[1].has_no_value());
    assert_eq!(burst.outputs.len(), 1);
    assert_eq!(burst.outputs[0].dimensions, Dimensions::from_slice(&[2, 3]));
    assert_eq!(memories.len(), 2);
    assert!(measure);

    let shapes = vec![OutputShape {
        dimensions: Dimensions::from_slice(&[2, 3]),
        is_sufficient: true,
    }];
    let timing = Timing {
        time_on_device: 5,
        time_in_driver: 9,
    };
    assert!(server.send_result(ErrorStatus::None, &shapes, timing));

    let (status, received, received_timing) = controller.receive().unwrap();
    assert_eq!(status, ErrorStatus::None);
    assert_eq!(received, shapes);
    assert_eq!(received_timing, timing);
}

#[test]
fn near_capacity_request_fits_and_oversized_does_not() {
    // Header + descriptor + 20 dims + measure datum = 23 elements.
    let fitting = Request {
        inputs: vec![pool_argument(0, 4, &[1; 20])],
        outputs: vec![],
        pools: vec![RequestPool::Memory(MemoryObject::new_shared(4))],
    };
    let (controller, server) = create_burst_with_capacity(DEFAULT_POLLING_WINDOW, 24);
    assert_eq!(controller.send(&fitting, false), SendStatus::Sent);
    assert!(server.wait_request().is_some());

    let (tight_controller, _tight_server) =
        create_burst_with_capacity(DEFAULT_POLLING_WINDOW, 16);
    assert_eq!(
        tight_controller.send(&fitting, false),
        SendStatus::NotRepresentable
    );
}

#[test]
fn device_token_pool_is_not_representable() {
    let (controller, _server) = create_burst_with_capacity(DEFAULT_POLLING_WINDOW, 64);
    let request = Request {
        inputs: vec![pool_argument(0, 4, &[1])],
        outputs: vec![],
        pools: vec![RequestPool::DeviceToken(3)],
    };
    assert_eq!(controller.send(&request, false), SendStatus::NotRepresentable);
}

#[test]
fn slots_are_reused_and_recycled() {
    let (controller, server) = create_burst_with_capacity(DEFAULT_POLLING_WINDOW, 256);
    let memory = MemoryObject::new_shared(8);
    let request = Request {
        inputs: vec![pool_argument(0, 8, &[2])],
        outputs: vec![],
        pools: vec![RequestPool::Memory(memory.clone())],
    };

    for _ in 0..2 {
        assert_eq!(controller.send(&request, false), SendStatus::Sent);
        let (_, memories, _) = server.wait_request().unwrap();
        assert_eq!(MemoryId::of(&memories[0]), MemoryId::of(&memory));
    }

    // Dropping the binding recycles the slot; the next send rebinds.
    controller.forget_memory(MemoryId::of(&memory));
    assert_eq!(controller.send(&request, false), SendStatus::Sent);
    let (_, memories, _) = server.wait_request().unwrap();
    assert_eq!(MemoryId::of(&memories[0]), MemoryId::of(&memory));
}

#[test]
fn undersized_packet_headers_are_rejected_without_panic() {
    let requests = Arc::new(RingChannel::new(16));
    let results = Arc::new(RingChannel::new(16));
    let server = Arc::new(BurstServer::new(
        requests.clone(),
        results.clone(),
        DEFAULT_POLLING_WINDOW,
    ));
    let controller = ExecutionBurstController::new(
        requests.clone(),
        results.clone(),
        server.clone(),
        DEFAULT_POLLING_WINDOW,
    );

    // A header announcing fewer datums than any real packet carries must not
    // make either receiver read past the header.
    assert!(requests.write(&[RequestDatum::PacketInformation {
        packet_size: 0,
        num_inputs: 0,
        num_outputs: 0,
        num_pools: 0,
    }]));
    assert!(server.wait_request().is_none());

    assert!(results.write(&[ResultDatum::PacketInformation {
        packet_size: 0,
        status: ErrorStatus::None,
        num_operands: 0,
    }]));
    assert!(controller.receive().is_none());
    assert!(controller.is_invalidated());
}

#[test]
fn invalidation_wakes_blocked_receive() {
    let (controller, server) = create_burst_with_capacity(Duration::ZERO, 64);

    let waiter = {
        let controller = controller.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let received = controller.receive();
            (received, started.elapsed())
        })
    };
    // Give the receiver time to park before pulling the plug.
    thread::sleep(Duration::from_millis(50));
    server.invalidate();

    let (received, elapsed) = waiter.join().unwrap();
    assert!(received.is_none());
    assert!(elapsed < Duration::from_secs(5));

    // The dead session fails fast in both directions afterwards.
    assert!(controller.is_invalidated());
    assert_eq!(
        controller.send(&Request::default(), false),
        SendStatus::ChannelUnavailable
    );
    assert!(controller.receive().is_none());
}
