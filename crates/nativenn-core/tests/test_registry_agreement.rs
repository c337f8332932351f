//! The registry mirrors the native slots after any accessor sequence.

mod common;

use common::{parameter, tracked, Tracked, FEATURES};
use nativenn_core::prelude::*;
use nativenn_core::testing::{assert_registry_agrees, reference_engine, registry_disagreement};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    SetParameter(&'static str, Option<f64>),
    SetBuffer(&'static str, Option<f64>),
    ReadParameter(&'static str),
    ReadBuffer(&'static str),
    FailingSet(&'static str),
    Reset,
    Forward,
    Migrate(DType),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let parameter_name = prop_oneof![Just(slot::WEIGHT), Just(slot::BIAS)];
    let buffer_name = prop_oneof![Just(slot::RUNNING_MEAN), Just(slot::RUNNING_VAR)];
    let value = prop::option::of(-10.0..10.0f64);
    prop_oneof![
        (parameter_name.clone(), value.clone()).prop_map(|(n, v)| Op::SetParameter(n, v)),
        (buffer_name.clone(), value).prop_map(|(n, v)| Op::SetBuffer(n, v)),
        parameter_name.clone().prop_map(Op::ReadParameter),
        buffer_name.prop_map(Op::ReadBuffer),
        parameter_name.prop_map(Op::FailingSet),
        Just(Op::Reset),
        Just(Op::Forward),
        prop_oneof![Just(DType::Float32), Just(DType::Float64)].prop_map(Op::Migrate),
    ]
}

fn apply(native: &ReferenceEngine, engine: &Engine, module: &Module<Tracked>, op: &Op) {
    let n = FEATURES as usize;
    match op {
        Op::SetParameter(name, value) => {
            let value = value.map(|v| parameter(engine, &vec![v; n]));
            let value = value.map(|p| p.to_dtype(module.dtype()).and_then(Tensor::into_parameter).unwrap());
            module.set_parameter(name, value.as_ref()).unwrap();
        }
        Op::SetBuffer(name, value) => {
            let options = TensorOptions::default().dtype(module.dtype());
            let value = value.map(|v| Tensor::full(engine, &[FEATURES], v, options).unwrap());
            module.set_buffer(name, value.as_ref()).unwrap();
        }
        Op::ReadParameter(name) => {
            module.parameter(name).unwrap();
        }
        Op::ReadBuffer(name) => {
            module.buffer(name).unwrap();
        }
        Op::FailingSet(name) => {
            native.fail_on("module_set_slot", 0, NativeErrorKind::Runtime, "rejected");
            let value = parameter(engine, &vec![0.0; n]);
            assert!(module.set_parameter(name, Some(&value)).is_err());
        }
        Op::Reset => module.reset_running_stats().unwrap(),
        Op::Forward => {
            let options = TensorOptions::default().dtype(module.dtype());
            let input = Tensor::ones(engine, &[3, FEATURES], options).unwrap();
            // Emptied affine slots still forward; the output is not inspected.
            let _ = module.forward(&input);
        }
        Op::Migrate(dtype) => module.to_dtype(*dtype).unwrap(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_registry_mirrors_native_slots(ops in prop::collection::vec(op_strategy(), 1..24)) {
        let (native, engine) = reference_engine();
        let module = tracked(&engine);
        for op in &ops {
            apply(&native, &engine, &module, op);
            prop_assert_eq!(registry_disagreement(&module), None, "after {:?}", op);
        }
    }
}

#[cfg(test)]
mod accessor_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_null_slot_round_trip() {
        let (native, engine) = reference_engine();
        let module = tracked(&engine);

        module.set_bias(None).unwrap();
        assert!(module.bias().unwrap().is_none());
        assert!(!module.registry().contains(slot::BIAS));
        assert_eq!(
            module.named_parameters().into_iter().map(|(n, _)| n).collect::<Vec<_>>(),
            vec![slot::WEIGHT.to_string()]
        );
        assert_eq!(native.live_modules(), 1);
        assert_registry_agrees(&module);
    }

    #[test]
    fn test_set_is_read_back_and_registered() {
        let (_native, engine) = reference_engine();
        let module = tracked(&engine);
        let bias = parameter(&engine, &[0.5, -0.5, 1.5, -1.5]);

        module.set_bias(Some(&bias)).unwrap();
        let read = module.bias().unwrap().unwrap();
        assert_eq!(read.to_vec().unwrap(), vec![0.5, -0.5, 1.5, -1.5]);
        assert_eq!(read.storage_id().unwrap(), bias.storage_id().unwrap());

        let registry = module.registry();
        let registered = registry.parameter(slot::BIAS).unwrap();
        assert_eq!(registered.storage_id().unwrap(), bias.storage_id().unwrap());
    }

    #[test]
    fn test_failed_set_leaves_registry_unchanged() {
        let (native, engine) = reference_engine();
        let module = tracked(&engine);
        let before = module.registry().parameter(slot::WEIGHT).unwrap().storage_id().unwrap();
        let live = native.live_tensors();

        native.fail_on("module_set_slot", 0, NativeErrorKind::InvalidArgument, "bad weight");
        let weight = parameter(&engine, &[2.0; 4]);
        let err = module.set_weight(Some(&weight)).unwrap_err();

        assert_eq!(err, BindingError::native(NativeErrorKind::InvalidArgument, "bad weight"));
        let after = module.registry().parameter(slot::WEIGHT).unwrap().storage_id().unwrap();
        assert_eq!(after, before);
        drop(weight);
        assert_eq!(native.live_tensors(), live);
        assert_registry_agrees(&module);
    }

    #[test]
    fn test_replaced_entry_is_released() {
        let (native, engine) = reference_engine();
        let module = tracked(&engine);
        let live = native.live_tensors();

        let mean = Tensor::zeros(&engine, &[FEATURES], TensorOptions::default()).unwrap();
        module.set_running_mean(Some(&mean)).unwrap();
        drop(mean);
        // The registry's reference replaced the previous one.
        assert_eq!(native.live_tensors(), live);
    }

    #[test]
    fn test_slot_declarations_are_enforced() {
        let (native, engine) = reference_engine();
        let module = tracked(&engine);
        let calls = native.total_calls();

        assert!(matches!(module.parameter("gamma"), Err(BindingError::UnknownSlot { .. })));
        assert!(matches!(
            module.parameter(slot::RUNNING_MEAN),
            Err(BindingError::SlotKindMismatch { expected: SlotKind::Buffer, .. })
        ));
        let count = Tensor::zeros(&engine, &[], TensorOptions::default().dtype(DType::Int64)).unwrap();
        let calls_after_create = native.total_calls();
        assert!(calls_after_create > calls);
        assert!(matches!(
            module.set_buffer(slot::NUM_BATCHES_TRACKED, Some(&count)),
            Err(BindingError::ReadOnlySlot { .. })
        ));
        assert_eq!(native.total_calls(), calls_after_create);
    }

    #[test]
    fn test_reset_running_stats() {
        let (native, engine) = reference_engine();
        let module = tracked(&engine);
        let input = common::batch(&engine, 3.0);
        for _ in 0..2 {
            module.forward(&input).unwrap();
        }
        let mean = Tensor::full(&engine, &[FEATURES], 7.0, TensorOptions::default()).unwrap();
        let var = Tensor::full(&engine, &[FEATURES], 9.0, TensorOptions::default()).unwrap();
        module.set_running_mean(Some(&mean)).unwrap();
        module.set_running_var(Some(&var)).unwrap();
        let registered = module.registry().buffer(slot::RUNNING_MEAN).unwrap().storage_id().unwrap();

        module.reset_running_stats().unwrap();

        assert_eq!(module.running_mean().unwrap().unwrap().to_vec().unwrap(), vec![0.0; 4]);
        assert_eq!(module.running_var().unwrap().unwrap().to_vec().unwrap(), vec![1.0; 4]);
        assert_eq!(module.num_batches_tracked().unwrap().unwrap().to_vec().unwrap(), vec![0.0]);
        let after = module.registry().buffer(slot::RUNNING_MEAN).unwrap().storage_id().unwrap();
        assert_eq!(after, registered);
        assert_eq!(native.double_releases(), 0);
    }
}
