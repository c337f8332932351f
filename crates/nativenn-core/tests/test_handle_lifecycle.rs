//! Handle ownership and release across tensors and modules.

mod common;

use common::{batch, parameter, tracked, Tracked, FEATURES};
use nativenn_core::prelude::*;
use nativenn_core::testing::{reference_engine, registry_disagreement};
use std::sync::{Arc, Barrier};
use std::thread;

#[cfg(test)]
mod release_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_dispose_twice_is_noop() {
        let (native, engine) = reference_engine();
        let module = tracked(&engine);
        assert!(native.live_tensors() > 0);

        module.dispose();
        module.dispose();
        assert!(module.is_disposed());
        assert_eq!(native.live_modules(), 0);
        assert_eq!(native.live_tensors(), 0);

        drop(module);
        assert_eq!(native.double_releases(), 0);
        assert_eq!(native.calls("module_release"), 1);
    }

    #[test]
    fn test_drop_releases_module_and_registry() {
        let (native, engine) = reference_engine();
        {
            let module = tracked(&engine);
            assert_eq!(module.named_parameters().len(), 2);
            assert_eq!(module.named_buffers().len(), 3);
        }
        assert_eq!(native.live_modules(), 0);
        assert_eq!(native.live_tensors(), 0);
        assert_eq!(native.double_releases(), 0);
    }

    #[test]
    fn test_use_after_dispose_is_rejected() {
        let (native, engine) = reference_engine();
        let module = tracked(&engine);
        let input = batch(&engine, 1.0);
        module.dispose();

        let forward_calls = native.calls("module_forward");
        assert!(matches!(module.forward(&input), Err(BindingError::Released { .. })));
        assert!(matches!(module.weight(), Err(BindingError::Released { .. })));
        assert!(matches!(module.to_dtype(DType::Float64), Err(BindingError::Released { .. })));
        assert_eq!(native.calls("module_forward"), forward_calls);
    }

    #[test]
    fn test_fetched_parameter_outlives_module() {
        let (native, engine) = reference_engine();
        let module = tracked(&engine);
        let weight = module.weight().unwrap().unwrap();
        module.dispose();

        assert_eq!(weight.to_vec().unwrap(), vec![1.0; FEATURES as usize]);
        drop(weight);
        assert_eq!(native.live_tensors(), 0);
    }

    #[test]
    fn test_forward_output_is_independent() {
        let (native, engine) = reference_engine();
        let module = tracked(&engine);
        let input = batch(&engine, 0.5);
        let output = module.forward(&input).unwrap();

        drop(module);
        drop(input);
        assert_eq!(output.shape().unwrap(), vec![2, FEATURES]);
        assert_eq!(native.live_tensors(), 1);
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_failed_construction_leaks_nothing() {
        let (native, engine) = reference_engine();
        native.fail_after("module_new", 0, NativeErrorKind::Allocation, "out of memory");

        let err = Module::<Tracked>::new(&engine, FEATURES).unwrap_err();
        assert_eq!(err.native_kind(), Some(NativeErrorKind::Allocation));
        assert_eq!(native.live_modules(), 0);
        assert_eq!(native.live_tensors(), 0);
    }

    #[test]
    fn test_failed_registry_mirroring_leaks_nothing() {
        let (native, engine) = reference_engine();
        native.fail_on("module_slot", 2, NativeErrorKind::Runtime, "slot lookup failed");

        let err = Module::<Tracked>::new(&engine, FEATURES).unwrap_err();
        assert!(err.to_string().contains("slot lookup failed"));
        assert_eq!(native.live_modules(), 0);
        assert_eq!(native.live_tensors(), 0);
    }

    #[test]
    fn test_handle_returned_with_failure_is_released() {
        let (native, engine) = reference_engine();
        let t = batch(&engine, 1.0);
        native.fail_after("tensor_alias", 0, NativeErrorKind::Runtime, "alias failed");

        assert!(t.shallow_clone().is_err());
        assert_eq!(native.live_tensors(), 1);
    }

    #[test]
    fn test_null_without_failure_is_reported() {
        let (_native, engine) = reference_engine();
        let mut t = batch(&engine, 1.0);
        let raw = t.raw().unwrap();
        t.dispose();

        let err = engine
            .invoke_tensor("tensor_alias", |native, status| native.tensor_alias(raw, status))
            .unwrap_err();
        assert_eq!(err.native_kind(), Some(NativeErrorKind::InvalidHandle));

        let err = engine
            .invoke_tensor("custom_entry", |_, _| RawHandle::NULL)
            .unwrap_err();
        assert_eq!(err, BindingError::null_handle("custom_entry"));
    }

    #[test]
    fn test_forward_failure_surfaces_engine_message() {
        let (native, engine) = reference_engine();
        let module = tracked(&engine);
        let input = batch(&engine, 1.0);
        native.fail_on("module_forward", 0, NativeErrorKind::Runtime, "kernel launch failed");

        let err = module.forward(&input).unwrap_err();
        assert_eq!(
            err,
            BindingError::native(NativeErrorKind::Runtime, "kernel launch failed")
        );
        assert!(module.forward(&input).is_ok());
    }

    #[test]
    fn test_silent_void_failure_is_surfaced() {
        let (native, engine) = reference_engine();
        let module = tracked(&engine);
        native.fail_on("module_reset_running_stats", 0, NativeErrorKind::Runtime, "reset failed");

        let err = module.reset_running_stats().unwrap_err();
        assert_eq!(err.native_kind(), Some(NativeErrorKind::Runtime));
    }
}

#[cfg(test)]
mod concurrency_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_concurrent_forwards_do_not_share_errors() {
        let (_native, engine) = reference_engine();
        let good = Arc::new(tracked(&engine));
        let bad = Arc::new(tracked(&engine));
        let barrier = Arc::new(Barrier::new(2));
        let rounds = 50;

        let good_thread = {
            let (module, barrier, engine) = (good.clone(), barrier.clone(), engine.clone());
            thread::spawn(move || {
                let input = batch(&engine, 1.0);
                barrier.wait();
                (0..rounds).filter(|_| module.forward(&input).is_ok()).count()
            })
        };
        let bad_thread = {
            let (module, barrier, engine) = (bad.clone(), barrier.clone(), engine.clone());
            thread::spawn(move || {
                // Wrong channel count: rejected by the engine, not by the rank check.
                let input = Tensor::zeros(&engine, &[2, FEATURES + 1], TensorOptions::default()).unwrap();
                barrier.wait();
                (0..rounds)
                    .filter(|_| {
                        matches!(
                            module.forward(&input),
                            Err(BindingError::Native { kind: NativeErrorKind::InvalidArgument, .. })
                        )
                    })
                    .count()
            })
        };

        assert_eq!(good_thread.join().unwrap(), rounds);
        assert_eq!(bad_thread.join().unwrap(), rounds);
    }

    #[test]
    fn test_concurrent_setters_keep_registry_consistent() {
        let (_native, engine) = reference_engine();
        let module = Arc::new(tracked(&engine));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let (module, engine) = (module.clone(), engine.clone());
                thread::spawn(move || {
                    for round in 0..20 {
                        let value = f64::from(i * 100 + round);
                        let bias = parameter(&engine, &[value; FEATURES as usize]);
                        module.set_bias(Some(&bias)).unwrap();
                        if round % 3 == 0 {
                            module.set_bias(None).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry_disagreement(&*module), None);
    }
}
