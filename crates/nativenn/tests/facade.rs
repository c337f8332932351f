//! The facade prelude is enough to build and run modules.

use nativenn::prelude::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn engine() -> (Arc<ReferenceEngine>, Engine) {
    let native = Arc::new(ReferenceEngine::new());
    let defaults = EngineDefaultsBuilder::new().device(Device::CPU).dtype(DType::Float32).build();
    (native.clone(), Engine::with_defaults(native, defaults))
}

#[test]
fn test_prelude_builds_a_small_network() {
    let (native, engine) = engine();
    let conv = Conv2dConfig::new(1, 4, 3).padding(1).build(&engine).unwrap();
    let norm = BatchNorm2d::new(&engine, NormConfig::new(4)).unwrap();

    let input = Tensor::zeros(&engine, &[2, 1, 6, 6], TensorOptions::default()).unwrap();
    let hidden = conv.forward(&input).unwrap();
    let output = norm.forward(&hidden).unwrap();

    assert_eq!(output.shape().unwrap(), vec![2, 4, 6, 6]);
    let bias = conv.bias().unwrap().unwrap().to_vec().unwrap();
    assert_eq!(output.to_vec().unwrap()[36], bias[1]);

    drop((input, hidden, output));
    conv.dispose();
    norm.dispose();
    assert_eq!(native.live_tensors(), 0);
    assert_eq!(native.live_modules(), 0);
}

#[test]
fn test_functional_matches_module() {
    let (_native, engine) = engine();
    let conv = Conv1dConfig::new(2, 3, 3).stride(2).build(&engine).unwrap();
    let input = Tensor::ones(&engine, &[1, 2, 9], TensorOptions::default()).unwrap();

    let weight = conv.weight().unwrap().unwrap();
    let bias = conv.bias().unwrap().unwrap();
    let options = ConvOptions::default().stride(2);
    let functional = functional::conv1d(&input, &weight, Some(&bias), &options).unwrap();
    let module = conv.forward(&input).unwrap();

    assert_eq!(functional.shape().unwrap(), module.shape().unwrap());
    assert_eq!(functional.to_vec().unwrap(), module.to_vec().unwrap());
}

#[cfg(feature = "serde")]
#[test]
fn test_options_serialize() {
    let config = Conv2dConfig::new(3, 8, (3, 5)).padding(Padding::Same);
    let json = serde_json::to_string(&config).unwrap();
    let parsed: Conv2dConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, config);

    let norm = NormConfig::<2>::instance(4).eps(1e-3);
    let json = serde_json::to_string(&norm).unwrap();
    assert_eq!(serde_json::from_str::<NormConfig<2>>(&json).unwrap(), norm);
}
