use std::sync::atomic::Ordering;
use std::sync::Arc;

use accelport_backend_loop::LoopbackFactory;
use accelport_core::{
    ArgumentLifetime, Dimensions, ErrorStatus, ExecutionPreference, MetaModel, Model, Operand,
    OperandLifetime, OperandType, Operation, OperationCode, Priority, RequestArgument, Revision,
};
use accelport_device::{CacheToken, DriverFactory, VersionedDevice, CACHE_TOKEN_LEN};
use accelport_memory::Request;

fn tensor(lifetime: OperandLifetime) -> Operand {
    Operand {
        ty: OperandType::TensorFloat32,
        dimensions: Dimensions::from_slice(&[2]),
        scale: 0.0,
        zero_point: 0,
        lifetime,
        location: Default::default(),
        extra_params: None,
    }
}

fn add_model() -> Model {
    Model {
        operands: vec![
            tensor(OperandLifetime::ModelInput),
            tensor(OperandLifetime::ModelInput),
            tensor(OperandLifetime::ModelOutput),
        ],
        operations: vec![Operation {
            code: OperationCode::Add,
            inputs: vec![0, 1],
            outputs: vec![2],
        }],
        input_indexes: vec![0, 1],
        output_indexes: vec![2],
        ..Default::default()
    }
}

fn mixed_model() -> Model {
    let mut model = add_model();
    model.operands[2].lifetime = OperandLifetime::Temporary;
    model.operands.push(tensor(OperandLifetime::ModelOutput));
    model.operations.push(Operation {
        code: OperationCode::HardSwish,
        inputs: vec![2],
        outputs: vec![3],
    });
    model.output_indexes = vec![3];
    model
}

async fn connect(top: Revision) -> (Arc<LoopbackFactory>, Arc<VersionedDevice>) {
    let factory = LoopbackFactory::new("loop", top);
    let device = VersionedDevice::connect("loop", factory.boxed())
        .await
        .unwrap();
    (factory, device)
}

fn pool_arg() -> RequestArgument {
    RequestArgument {
        lifetime: ArgumentLifetime::Pool,
        location: Default::default(),
        dimensions: Dimensions::default(),
    }
}

fn two_in_one_out_request() -> Request {
    Request {
        inputs: vec![pool_arg(), pool_arg()],
        outputs: vec![pool_arg()],
        pools: vec![],
    }
}

#[test]
fn boxed_factory_counts_and_refuses_connects() {
    let factory = LoopbackFactory::new("loop", Revision::V1_3);
    let boxed = factory.boxed();
    assert!(boxed.connect().is_some());
    assert_eq!(factory.connects(), 1);

    factory.set_refuse(true);
    assert!(boxed.connect().is_none());
    assert_eq!(factory.connects(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn probe_falls_back_to_the_newest_answered_revision() {
    let (factory, device) = connect(Revision::V1_1).await;
    assert_eq!(device.revision().await, Revision::V1_1);
    assert_eq!(factory.connects(), 1);

    // 1.3 and 1.2 were each probed and refused before 1.1 answered.
    let driver = factory.current().unwrap();
    assert_eq!(driver.counters().capability_queries.load(Ordering::Acquire), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn death_triggers_exactly_one_reconnect() {
    let (factory, device) = connect(Revision::V1_3).await;
    let meta = MetaModel::new(add_model());

    let (status, supported) = device.get_supported_operations(&meta).await;
    assert_eq!(status, ErrorStatus::None);
    assert_eq!(supported, vec![true]);

    factory.current().unwrap().kill();
    let (status, supported) = device.get_supported_operations(&meta).await;
    assert_eq!(status, ErrorStatus::None);
    assert_eq!(supported, vec![true]);
    assert_eq!(factory.connects(), 2);
    assert!(!device.is_dead());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrecoverable_death_is_terminal_without_hanging() {
    let (factory, device) = connect(Revision::V1_3).await;
    let meta = MetaModel::new(add_model());

    factory.current().unwrap().kill();
    factory.set_refuse(true);

    let (status, _) = device.get_supported_operations(&meta).await;
    assert_eq!(status, ErrorStatus::DeadObject);
    assert!(device.is_dead());

    // Terminal state answers immediately, with no further connect attempts.
    factory.set_refuse(false);
    let (status, _) = device.get_supported_operations(&meta).await;
    assert_eq!(status, ErrorStatus::DeadObject);
    assert_eq!(factory.connects(), 1);
    assert!(device.wait().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_runs_recovery_synchronously() {
    let (factory, device) = connect(Revision::V1_2).await;
    factory.current().unwrap().kill();
    device.wait().await.unwrap();
    assert_eq!(factory.connects(), 2);
    assert_eq!(device.revision().await, Revision::V1_2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prepare_and_execute_round_trip() {
    let (_factory, device) = connect(Revision::V1_3).await;
    let model = add_model();
    let (status, prepared) = device
        .prepare_model(
            &model,
            ExecutionPreference::default(),
            Priority::default(),
            None,
            None,
            None,
        )
        .await;
    assert_eq!(status, ErrorStatus::None);
    let prepared = prepared.unwrap();

    let result = prepared
        .execute_synchronously(two_in_one_out_request(), true, None)
        .await;
    assert_eq!(result.status, ErrorStatus::None);
    assert_eq!(result.output_shapes.len(), 1);
    assert_eq!(
        result.output_shapes[0].dimensions,
        Dimensions::from_slice(&[2])
    );
    assert_ne!(result.timing.time_on_device, u64::MAX);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prepared_models_die_with_their_driver() {
    let (factory, device) = connect(Revision::V1_3).await;
    let (status, prepared) = device
        .prepare_model(
            &add_model(),
            ExecutionPreference::default(),
            Priority::default(),
            None,
            None,
            None,
        )
        .await;
    assert_eq!(status, ErrorStatus::None);
    let prepared = prepared.unwrap();

    factory.current().unwrap().kill();
    let result = prepared
        .execute_synchronously(two_in_one_out_request(), false, None)
        .await;
    assert_eq!(result.status, ErrorStatus::DeadObject);
    // Prepared handles are not recovered; only the device is.
    assert_eq!(factory.connects(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prepare_rejects_models_beyond_the_connected_revision() {
    let (_factory, device) = connect(Revision::V1_0).await;
    let (status, prepared) = device
        .prepare_model(
            &mixed_model(),
            ExecutionPreference::default(),
            Priority::default(),
            None,
            None,
            None,
        )
        .await;
    assert_eq!(status, ErrorStatus::InvalidArgument);
    assert!(prepared.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn supported_operations_are_remapped_through_a_slice() {
    let (_factory, device) = connect(Revision::V1_0).await;
    let meta = MetaModel::new(mixed_model());

    let (status, supported) = device.get_supported_operations(&meta).await;
    assert_eq!(status, ErrorStatus::None);
    assert_eq!(supported, vec![true, false]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prepare_from_cache_hits_and_misses() {
    let dir = tempfile::tempdir().unwrap();
    let token: CacheToken = [0x42; CACHE_TOKEN_LEN];
    let (_factory, device) = connect(Revision::V1_3).await;

    // Miss before anything was prepared with this token.
    let (status, prepared) = device
        .prepare_model_from_cache(None, dir.path(), token)
        .await;
    assert_eq!(status, ErrorStatus::GeneralFailure);
    assert!(prepared.is_none());

    let (status, _) = device
        .prepare_model(
            &add_model(),
            ExecutionPreference::default(),
            Priority::default(),
            None,
            Some(dir.path()),
            Some(token),
        )
        .await;
    assert_eq!(status, ErrorStatus::None);

    // Hit on the same driver instance.
    let (status, prepared) = device
        .prepare_model_from_cache(None, dir.path(), token)
        .await;
    assert_eq!(status, ErrorStatus::None);
    let prepared = prepared.unwrap();
    let result = prepared
        .execute_synchronously(two_in_one_out_request(), false, None)
        .await;
    assert_eq!(result.status, ErrorStatus::None);

    // A fresh service has a cold cache; the caller falls back to a full
    // preparation, which succeeds.
    let (_factory2, device2) = connect(Revision::V1_3).await;
    let (status, _) = device2
        .prepare_model_from_cache(None, dir.path(), token)
        .await;
    assert_eq!(status, ErrorStatus::GeneralFailure);
    let (status, prepared) = device2
        .prepare_model(
            &add_model(),
            ExecutionPreference::default(),
            Priority::default(),
            None,
            Some(dir.path()),
            Some(token),
        )
        .await;
    assert_eq!(status, ErrorStatus::None);
    assert!(prepared.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cache_prepare_below_v1_2_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let token: CacheToken = [9; CACHE_TOKEN_LEN];
    let (_factory, device) = connect(Revision::V1_1).await;
    let (status, prepared) = device
        .prepare_model_from_cache(None, dir.path(), token)
        .await;
    assert_eq!(status, ErrorStatus::GeneralFailure);
    assert!(prepared.is_none());
}
