//! Engine-agnostic checks shared by every `EngineApi` implementation.
//!
//! None of these import a graph definition, so they run unchanged against the
//! stub and against a real `libtensorflow`.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tfrs::decode::decode_ref;
use tfrs::{
    Array, Code, EngineApi, Error, Graph, Ownership, RawTensor, Session, SessionConfig, Status,
};

pub fn status_starts_ok(api: &Arc<dyn EngineApi>) {
    let status = Status::new(Arc::clone(api)).unwrap();
    assert_eq!(status.code(), Code::Ok);
    assert!(status.is_ok());
    assert!(status.check().is_ok());
}

pub fn numeric_buffer_roundtrip(api: &Arc<dyn EngineApi>) {
    let mut rng = StdRng::seed_from_u64(11);
    let values: Vec<f32> = (0..12).map(|_| rng.gen_range(-8.0..8.0)).collect();
    let array = Array::new([3, 4], values).unwrap();

    let tensor = RawTensor::from_array(Arc::clone(api), &array).unwrap();
    assert_eq!(tensor.ownership(), Ownership::Owned);
    assert_eq!(tensor.dims().unwrap(), vec![3, 4]);
    assert_eq!(tensor.byte_len(), 12 * 4);

    let decoded = decode_ref(&tensor).unwrap();
    assert_eq!(decoded, array);
}

pub fn string_buffer_roundtrip(api: &Arc<dyn EngineApi>) {
    let array = Array::from_strings(
        [3],
        vec!["alpha".to_string(), String::new(), "g\u{e9}n\u{e9}ral".to_string()],
    )
    .unwrap();
    if !api.string_layout().is_supported() {
        let err = RawTensor::from_array(Arc::clone(api), &array).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDtype { .. }));
        return;
    }
    let tensor = RawTensor::from_array(Arc::clone(api), &array).unwrap();
    let decoded = decode_ref(&tensor).unwrap();
    assert_eq!(decoded, array);
}

pub fn missing_operation_is_none(api: &Arc<dyn EngineApi>) {
    let graph = Graph::new(Arc::clone(api)).unwrap();
    assert!(graph.operation_by_name("does_not_exist").is_none());
    assert!(graph.tensor_by_name("does_not_exist:0").is_err());
}

pub fn empty_graph_session_closes_once(api: &Arc<dyn EngineApi>) {
    let graph = Arc::new(Graph::new(Arc::clone(api)).unwrap());
    let session = Session::new(graph, SessionConfig::default()).unwrap();
    assert!(!session.is_closed());
    session.close().unwrap();
    assert!(session.is_closed());
    session.close().unwrap();
}
