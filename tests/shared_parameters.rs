use kronfac::{Error, FactorArguments, FactorStrategy, Linear, ModuleMode, TrackedModule, TrackerState};
use numr::autograd::{GradStore, Var};
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

fn cpu_setup() -> (CpuClient, CpuDevice) {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (client, device)
}

/// Scalar Linear(1 → 1) reused several times per pass, as in weight tying.
fn shared_scalar(device: &CpuDevice) -> TrackedModule<CpuRuntime, Linear<CpuRuntime>> {
    let weight = Tensor::<CpuRuntime>::from_slice(&[1.0f32], &[1, 1], device);
    let args = FactorArguments::default()
        .with_strategy(FactorStrategy::Diagonal)
        .with_shared_parameters(true);
    let mut module = TrackedModule::new("tied", Linear::new(weight, None, false), args).expect("valid args");
    module.set_mode(ModuleMode::LambdaFit).expect("lambda phase");
    module
}

const ACTIVATIONS: [f32; 3] = [1.0, 2.0, 3.0];
const GRADIENTS: [f32; 3] = [10.0, 20.0, 30.0];

fn forward_all(client: &CpuClient, device: &CpuDevice, module: &mut TrackedModule<CpuRuntime, Linear<CpuRuntime>>) {
    for a in ACTIVATIONS {
        let input = Var::new(Tensor::<CpuRuntime>::from_slice(&[a], &[1, 1], device), false);
        module.forward(client, &input).unwrap();
    }
}

fn lambda_value(module: &TrackedModule<CpuRuntime, Linear<CpuRuntime>>) -> f32 {
    module.storage().lambda.lambda_matrix.as_ref().unwrap().to_vec::<f32>()[0]
}

#[test]
fn test_three_invocations_pair_in_reverse_order() {
    let (client, device) = cpu_setup();
    let mut module = shared_scalar(&device);
    forward_all(&client, &device, &mut module);

    // backprop reaches the last invocation first
    for g in GRADIENTS.iter().rev() {
        let grad = Tensor::<CpuRuntime>::from_slice(&[*g], &[1, 1], &device);
        module.backward(&client, &grad).unwrap();
        assert_eq!(module.tracker_state(), TrackerState::SharedAccumulating);
    }
    assert!(module.storage().lambda.lambda_matrix.is_none(), "lambda updates once, at finalize");
    module.finalize_iteration(&client).unwrap();

    // (10·1 + 20·2 + 30·3)²
    assert_eq!(lambda_value(&module), 140.0 * 140.0);
    assert_eq!(module.storage().lambda.num_lambda_processed, Some(1));
    assert_eq!(module.tracker_state(), TrackerState::Idle);
}

#[test]
fn test_swapped_order_is_detectable() {
    let (client, device) = cpu_setup();
    let mut module = shared_scalar(&device);
    forward_all(&client, &device, &mut module);

    // gradients delivered in forward order pair g1 with a3 and g3 with a1
    for g in GRADIENTS {
        let grad = Tensor::<CpuRuntime>::from_slice(&[g], &[1, 1], &device);
        module.backward(&client, &grad).unwrap();
    }
    module.finalize_iteration(&client).unwrap();

    // (10·3 + 20·2 + 30·1)²
    assert_eq!(lambda_value(&module), 100.0 * 100.0);
    assert_ne!(lambda_value(&module), 140.0 * 140.0);
}

#[test]
fn test_grad_store_dispatch_pairs_by_output() {
    let (client, device) = cpu_setup();
    let mut module = shared_scalar(&device);

    let mut grads = GradStore::new();
    for (a, g) in ACTIVATIONS.iter().zip(GRADIENTS) {
        let input = Var::new(Tensor::<CpuRuntime>::from_slice(&[*a], &[1, 1], &device), false);
        let output = module.forward(&client, &input).unwrap();
        grads.insert(output.id(), Tensor::<CpuRuntime>::from_slice(&[g], &[1, 1], &device));
    }

    assert_eq!(module.backward_from_grads(&client, &grads).unwrap(), 3);
    module.finalize_iteration(&client).unwrap();
    assert_eq!(lambda_value(&module), 140.0 * 140.0);
}

#[test]
fn test_extra_backward_is_cache_miss() {
    let (client, device) = cpu_setup();
    let mut module = shared_scalar(&device);
    let input = Var::new(Tensor::<CpuRuntime>::from_slice(&[1.0f32], &[1, 1], &device), false);
    module.forward(&client, &input).unwrap();

    let grad = Tensor::<CpuRuntime>::from_slice(&[1.0f32], &[1, 1], &device);
    module.backward(&client, &grad).unwrap();
    let err = module.backward(&client, &grad).unwrap_err();
    assert!(matches!(err, Error::CacheNotFound { .. }));
}

#[test]
fn test_passes_accumulate_independently() {
    let (client, device) = cpu_setup();
    let mut module = shared_scalar(&device);

    for _ in 0..2 {
        forward_all(&client, &device, &mut module);
        for g in GRADIENTS.iter().rev() {
            let grad = Tensor::<CpuRuntime>::from_slice(&[*g], &[1, 1], &device);
            module.backward(&client, &grad).unwrap();
        }
        module.finalize_iteration(&client).unwrap();
    }

    assert_eq!(lambda_value(&module), 2.0 * 140.0 * 140.0);
    assert_eq!(module.storage().lambda.num_lambda_processed, Some(2));
}

#[test]
fn test_unconsumed_invocations_are_dropped_at_finalize() {
    let (client, device) = cpu_setup();
    let mut module = shared_scalar(&device);
    forward_all(&client, &device, &mut module);

    // only the last invocation receives a gradient
    let grad = Tensor::<CpuRuntime>::from_slice(&[30.0f32], &[1, 1], &device);
    module.backward(&client, &grad).unwrap();
    module.finalize_iteration(&client).unwrap();
    assert_eq!(lambda_value(&module), 90.0 * 90.0);
    assert_eq!(module.next_pending_output(), None);

    // the next pass starts clean
    forward_all(&client, &device, &mut module);
    for g in GRADIENTS.iter().rev() {
        let grad = Tensor::<CpuRuntime>::from_slice(&[*g], &[1, 1], &device);
        module.backward(&client, &grad).unwrap();
    }
    module.finalize_iteration(&client).unwrap();
    assert_eq!(lambda_value(&module), 90.0 * 90.0 + 140.0 * 140.0);
}
