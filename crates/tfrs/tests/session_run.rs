use std::ffi::CString;
use std::ptr;
use std::sync::Arc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tfrs::{
    Array, DType, EngineApi, Error, FeedDict, Fetch, FetchResult, Session, SessionConfig,
    StringLayout,
};
use tfrs_backend_tests::{stub_graph, GraphDef, RunResponse, StubEngine, StubOutput};

fn engine() -> Arc<StubEngine> {
    Arc::new(StubEngine::new())
}

fn matmul_graph() -> GraphDef {
    GraphDef::new()
        .tensor_op("x", DType::Float, Some(&[2, 2]))
        .tensor_op("y", DType::Float, Some(&[2, 2]))
        .tensor_op("count", DType::Int32, Some(&[]))
        .target_op("init")
}

fn open(engine: &Arc<StubEngine>, def: &GraphDef) -> Result<Session> {
    let graph = stub_graph(engine, def);
    Ok(Session::new(graph, SessionConfig::default())?)
}

/// Echoes the first feed back as every fetched output.
fn echo_first_feed(engine: &StubEngine) {
    engine.respond_with(|request| {
        let feed = &request.feeds[0];
        RunResponse::Outputs(
            request
                .fetches
                .iter()
                .map(|_| StubOutput::raw(feed.dtype, &feed.dims, feed.bytes.clone()))
                .collect(),
        )
    });
}

#[test]
fn single_tensor_fetch_returns_fed_matrix() -> Result<()> {
    let engine = engine();
    let session = open(&engine, &matmul_graph())?;
    let graph = Arc::clone(session.graph());
    let x = graph.tensor_by_name("x:0")?;
    let y = graph.tensor_by_name("y:0")?;
    echo_first_feed(&engine);

    let input = Array::new([2, 2], vec![1.0f32, 2.0, 3.0, 4.0])?;
    let feeds = FeedDict::new().with(&x, input.clone());
    let result = session.run(&y, &feeds)?;

    let value = result.into_array().expect("single fetch yields one array");
    assert_eq!(value.dims(), &[2, 2]);
    assert_eq!(value.as_slice::<f32>(), Some(&[1.0f32, 2.0, 3.0, 4.0][..]));

    let run = engine.last_run().expect("run recorded");
    assert_eq!(run.feeds.len(), 1);
    assert_eq!(run.feeds[0].name, "x:0");
    assert_eq!(run.feeds[0].dims, vec![2, 2]);
    assert_eq!(run.feeds[0].bytes, input.to_native_bytes());
    assert_eq!(run.fetches, vec!["y:0".to_string()]);
    assert!(run.targets.is_empty());

    drop(session);
    drop(graph);
    assert_eq!(engine.live_tensors(), 0);
    Ok(())
}

#[test]
fn eval_returns_scalar() -> Result<()> {
    let engine = engine();
    let session = open(&engine, &matmul_graph())?;
    let count = session.graph().tensor_by_name("count")?;
    engine.respond_with(|_| RunResponse::Outputs(vec![StubOutput::array(&Array::scalar(7i32))]));

    let value = session.eval(&count, &FeedDict::new())?;
    assert_eq!(value.rank(), 0);
    assert_eq!(value.to_scalar::<i32>(), Some(7));
    Ok(())
}

#[test]
fn nested_fetch_is_rebuilt_in_order() -> Result<()> {
    let engine = engine();
    let def = GraphDef::new()
        .tensor_op("a", DType::Int32, Some(&[]))
        .tensor_op("b", DType::Int32, Some(&[]))
        .tensor_op("c", DType::Int32, Some(&[]));
    let session = open(&engine, &def)?;
    engine.respond_with(|request| {
        RunResponse::Outputs(
            request
                .fetches
                .iter()
                .map(|name| {
                    let value = match name.as_str() {
                        "a:0" => 1i32,
                        "b:0" => 2,
                        _ => 3,
                    };
                    StubOutput::array(&Array::scalar(value))
                })
                .collect(),
        )
    });

    let fetch = Fetch::list([
        Fetch::name("a:0"),
        Fetch::dict([("second", Fetch::name("c:0")), ("first", Fetch::name("b:0"))]),
    ]);
    let result = session.run(fetch, &FeedDict::new())?;

    let run = engine.last_run().expect("run recorded");
    assert_eq!(run.fetches, vec!["a:0", "b:0", "c:0"]);

    let mut items = result.clone().into_list().expect("list result");
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_array().and_then(|a| a.to_scalar::<i32>()), Some(1));
    let dict = items.remove(1).into_dict().expect("dict result");
    assert_eq!(dict["first"].as_array().and_then(|a| a.to_scalar::<i32>()), Some(2));
    assert_eq!(dict["second"].as_array().and_then(|a| a.to_scalar::<i32>()), Some(3));

    let flat: Vec<i32> = result
        .flatten()
        .iter()
        .filter_map(|a| a.to_scalar::<i32>())
        .collect();
    assert_eq!(flat, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn repeated_fetch_uses_one_slot() -> Result<()> {
    let engine = engine();
    let session = open(&engine, &matmul_graph())?;
    let y = session.graph().tensor_by_name("y:0")?;

    let result = session.run(Fetch::list([&y, &y]), &FeedDict::new())?;

    assert_eq!(engine.last_run().expect("run recorded").fetches, vec!["y:0"]);
    let items = result.into_list().expect("list result");
    assert_eq!(items.len(), 2);
    assert_eq!(items[0], items[1]);
    assert_eq!(items[0].as_array().map(|a| a.dims().to_vec()), Some(vec![2, 2]));
    Ok(())
}

#[test]
fn operation_fetch_runs_as_target_with_empty_slot() -> Result<()> {
    let engine = engine();
    let session = open(&engine, &matmul_graph())?;
    let init = session.graph().operation("init")?;

    let result = session.run(
        Fetch::list([Fetch::from(&init), Fetch::name("count:0")]),
        &FeedDict::new(),
    )?;

    let run = engine.last_run().expect("run recorded");
    assert_eq!(run.targets, vec!["init".to_string()]);
    assert_eq!(run.fetches, vec!["count:0".to_string()]);
    let items = result.into_list().expect("list result");
    assert!(items[0].is_empty());
    assert_eq!(items[1].as_array().and_then(|a| a.to_scalar::<i32>()), Some(0));

    let bare = session.run("init", &FeedDict::new())?;
    assert_eq!(bare, FetchResult::Empty);
    Ok(())
}

#[test]
fn raw_operation_pointers_take_the_engine_name() -> Result<()> {
    let engine = engine();
    let session = open(&engine, &matmul_graph())?;
    let graph = session.graph();
    let name = CString::new("count")?;
    // SAFETY: the graph is live and the name is NUL-terminated.
    let raw = unsafe { graph.api().operation_by_name(graph.as_ptr(), &name) };

    // SAFETY: `raw` belongs to `graph`.
    let operation = unsafe { graph.operation_from_raw(raw) }.expect("non-null operation");
    assert_eq!(operation.name(), "count");
    assert_eq!(operation.num_outputs(), 1);
    assert!(graph.owns(&operation));
    assert_eq!(graph.output(&operation, 0)?.name(), "count:0");
    // SAFETY: null is always accepted.
    assert!(unsafe { graph.operation_from_raw(ptr::null_mut()) }.is_none());
    Ok(())
}

#[test]
fn bare_name_is_output_zero_for_lookup_but_a_target_for_fetch() -> Result<()> {
    let engine = engine();
    let session = open(&engine, &matmul_graph())?;
    assert_eq!(session.graph().tensor_by_name("count")?.name(), "count:0");

    let result = session.run("count", &FeedDict::new())?;
    assert_eq!(result, FetchResult::Empty);
    let run = engine.last_run().expect("run recorded");
    assert!(run.fetches.is_empty());
    assert_eq!(run.targets, vec!["count".to_string()]);
    Ok(())
}

#[test]
fn unknown_fetch_name_fails_before_run() -> Result<()> {
    let engine = engine();
    let session = open(&engine, &matmul_graph())?;

    let err = session.run("missing:0", &FeedDict::new()).unwrap_err();
    assert!(matches!(err, Error::UnknownFetch { ref name } if name == "missing:0"));
    let err = session.run("y:3", &FeedDict::new()).unwrap_err();
    assert!(matches!(err, Error::UnknownFetch { .. }));
    let err = session.run("missing", &FeedDict::new()).unwrap_err();
    assert!(matches!(err, Error::UnknownFetch { .. }));

    assert_eq!(engine.run_count(), 0);
    Ok(())
}

#[test]
fn feed_type_mismatch_makes_no_foreign_call() -> Result<()> {
    let engine = engine();
    let session = open(&engine, &matmul_graph())?;
    let x = session.graph().tensor_by_name("x:0")?;
    let y = session.graph().tensor_by_name("y:0")?;
    let allocations = engine.tensor_allocations();

    let feeds = FeedDict::new().with(&x, Array::new([2, 2], vec![1i32, 2, 3, 4])?);
    let err = session.run(&y, &feeds).unwrap_err();

    match err {
        Error::FeedType {
            tensor,
            expected,
            provided,
        } => {
            assert_eq!(tensor, "x:0");
            assert_eq!(expected, DType::Float);
            assert_eq!(provided, DType::Int32);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.run_count(), 0);
    assert_eq!(engine.tensor_allocations(), allocations);
    Ok(())
}

#[test]
fn feed_shape_mismatch_is_rejected() -> Result<()> {
    let engine = engine();
    let def = GraphDef::new()
        .tensor_op("x", DType::Float, Some(&[-1, 3]))
        .tensor_op("y", DType::Float, Some(&[-1, 3]));
    let session = open(&engine, &def)?;
    let x = session.graph().tensor_by_name("x:0")?;
    let y = session.graph().tensor_by_name("y:0")?;

    let ok = FeedDict::new().with(&x, Array::new([5, 3], vec![0.5f32; 15])?);
    session.run(&y, &ok)?;

    let bad = FeedDict::new().with(&x, Array::new([3, 2], vec![0.5f32; 6])?);
    let err = session.run(&y, &bad).unwrap_err();
    match err {
        Error::FeedShape {
            tensor,
            expected,
            provided,
        } => {
            assert_eq!(tensor, "x:0");
            assert_eq!(expected, "[?, 3]");
            assert_eq!(provided, vec![3, 2]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.run_count(), 1);
    Ok(())
}

#[test]
fn handles_from_another_graph_are_foreign() -> Result<()> {
    let engine = engine();
    let session = open(&engine, &matmul_graph())?;
    let other = stub_graph(&engine, &matmul_graph());
    let foreign = other.tensor_by_name("y:0")?;

    let err = session.run(&foreign, &FeedDict::new()).unwrap_err();
    assert!(matches!(err, Error::ForeignTensor { ref name } if name == "y:0"));

    let other_x = other.tensor_by_name("x:0")?;
    let feeds = FeedDict::new().with(&other_x, Array::new([2, 2], vec![0f32; 4])?);
    let err = session.run("y:0", &feeds).unwrap_err();
    assert!(matches!(err, Error::ForeignTensor { .. }));
    assert_eq!(engine.run_count(), 0);
    Ok(())
}

#[test]
fn duplicate_feed_key_keeps_last_value() -> Result<()> {
    let engine = engine();
    let session = open(&engine, &matmul_graph())?;
    let x = session.graph().tensor_by_name("x:0")?;
    let y = session.graph().tensor_by_name("y:0")?;

    let mut feeds = FeedDict::new();
    assert!(feeds
        .insert(x.clone(), Array::new([2, 2], vec![1f32; 4])?)
        .is_none());
    let replaced = feeds.insert(x.clone(), Array::new([2, 2], vec![9f32; 4])?);
    assert_eq!(replaced.and_then(|a| a.as_slice::<f32>().map(|s| s[0])), Some(1.0));
    assert_eq!(feeds.len(), 1);

    session.run(&y, &feeds)?;
    let run = engine.last_run().expect("run recorded");
    assert_eq!(run.feeds.len(), 1);
    assert_eq!(
        run.feeds[0].bytes,
        Array::new([2, 2], vec![9f32; 4])?.to_native_bytes()
    );
    Ok(())
}

#[test]
fn run_failure_returns_no_partial_results_and_frees_outputs() -> Result<()> {
    let engine = engine();
    let session = open(&engine, &matmul_graph())?;
    engine.respond_with(|_| RunResponse::Fail {
        message: "Matrix size-incompatible".to_string(),
        outputs: vec![
            StubOutput::array(&Array::new([2, 2], vec![0f32; 4]).unwrap()),
            StubOutput::array(&Array::scalar(1i32)),
        ],
    });

    let err = session
        .run(Fetch::list(["y:0", "count:0"]), &FeedDict::new())
        .unwrap_err();
    match err {
        Error::Run { message, .. } => assert_eq!(message, "Matrix size-incompatible"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.live_tensors(), 0);
    assert_eq!(engine.double_frees(), 0);
    Ok(())
}

#[test]
fn unsupported_output_dtype_names_the_tensor() -> Result<()> {
    let engine = engine();
    let def = GraphDef::new()
        .tensor_op("half", DType::Half, Some(&[2]))
        .tensor_op("y", DType::Float, Some(&[2]));
    let session = open(&engine, &def)?;

    let err = session.run("half:0", &FeedDict::new()).unwrap_err();
    match err {
        Error::UnsupportedDtype { dtype, tensor } => {
            assert_eq!(dtype, "float16");
            assert_eq!(tensor.as_deref(), Some("half:0"));
        }
        other => panic!("unexpected error: {other}"),
    }

    engine.respond_with(|_| {
        RunResponse::Outputs(vec![
            StubOutput::raw(99, &[2], vec![0; 8]),
            StubOutput::raw(DType::Float.tag(), &[2], vec![0; 8]),
        ])
    });
    let err = session
        .run(Fetch::list(["y:0", "half:0"]), &FeedDict::new())
        .unwrap_err();
    assert!(err.to_string().contains("dtype tag 99"));
    assert!(err.to_string().contains("'y:0'"));
    assert_eq!(engine.live_tensors(), 0);
    Ok(())
}

#[test]
fn malformed_output_buffer_is_a_decode_error() -> Result<()> {
    let engine = engine();
    let session = open(&engine, &matmul_graph())?;
    engine.respond_with(|_| {
        RunResponse::Outputs(vec![StubOutput::raw(DType::Float.tag(), &[2, 2], vec![0; 10])])
    });

    let err = session.run("y:0", &FeedDict::new()).unwrap_err();
    assert!(matches!(err, Error::Decode { tensor: Some(ref name), .. } if name == "y:0"));
    assert_eq!(engine.live_tensors(), 0);
    Ok(())
}

#[test]
fn numeric_outputs_decode_exactly() -> Result<()> {
    let engine = engine();
    let def = GraphDef::new()
        .tensor_op("f64", DType::Double, None)
        .tensor_op("i64", DType::Int64, None)
        .tensor_op("i16", DType::Int16, None)
        .tensor_op("u8", DType::UInt8, None)
        .tensor_op("flag", DType::Bool, None);
    let session = open(&engine, &def)?;

    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..8 {
        let rows = rng.gen_range(1..5usize);
        let cols = rng.gen_range(0..4usize);
        let n = rows * cols;
        let expected = vec![
            Array::new([rows, cols], (0..n).map(|_| rng.gen::<f64>()).collect::<Vec<_>>())?,
            Array::new([n], (0..n).map(|_| rng.gen::<i64>()).collect::<Vec<_>>())?,
            Array::new([cols, rows], (0..n).map(|_| rng.gen::<i16>()).collect::<Vec<_>>())?,
            Array::new([rows, cols, 1], (0..n).map(|_| rng.gen::<u8>()).collect::<Vec<_>>())?,
            Array::new([n], (0..n).map(|_| rng.gen::<bool>()).collect::<Vec<_>>())?,
        ];
        let outputs: Vec<StubOutput> = expected.iter().map(StubOutput::array).collect();
        engine.respond_with(move |_| RunResponse::Outputs(outputs.clone()));

        let result = session.run(
            Fetch::list(["f64:0", "i64:0", "i16:0", "u8:0", "flag:0"]),
            &FeedDict::new(),
        )?;
        assert_eq!(result.flatten(), expected);
    }
    assert_eq!(engine.live_tensors(), 0);
    Ok(())
}

#[test]
fn float_bit_patterns_and_int8_decode_bit_exact() -> Result<()> {
    let engine = engine();
    let def = GraphDef::new()
        .tensor_op("f32", DType::Float, None)
        .tensor_op("i8", DType::Int8, None);
    let session = open(&engine, &def)?;

    let mut rng = StdRng::seed_from_u64(7);
    let mut floats = vec![
        -0.0f32,
        f32::INFINITY,
        f32::NEG_INFINITY,
        f32::MIN_POSITIVE / 2.0,
        -f32::from_bits(1),
        f32::MAX,
    ];
    while floats.len() < 64 {
        let value = f32::from_bits(rng.gen::<u32>());
        if !value.is_nan() {
            floats.push(value);
        }
    }
    let mut ints: Vec<i8> = vec![i8::MIN, -1, 0, i8::MAX];
    ints.extend((0..60).map(|_| rng.gen::<i8>()));

    let expected = vec![Array::new([8, 8], floats)?, Array::new([4, 16], ints)?];
    let outputs: Vec<StubOutput> = expected.iter().map(StubOutput::array).collect();
    engine.respond_with(move |_| RunResponse::Outputs(outputs.clone()));

    let values = session
        .run(Fetch::list(["f32:0", "i8:0"]), &FeedDict::new())?
        .flatten();
    assert_eq!(values.len(), 2);
    for (value, expected) in values.iter().zip(&expected) {
        assert_eq!(value.dtype(), expected.dtype());
        assert_eq!(value.dims(), expected.dims());
        assert_eq!(value.to_native_bytes(), expected.to_native_bytes());
    }
    assert_eq!(engine.live_tensors(), 0);
    Ok(())
}

#[test]
fn string_outputs_decode_in_order() -> Result<()> {
    let engine = engine();
    let def = GraphDef::new()
        .tensor_op("word", DType::String, Some(&[]))
        .tensor_op("words", DType::String, Some(&[3]));
    let session = open(&engine, &def)?;
    let words = vec!["first".to_string(), String::new(), "x".repeat(200)];
    let expected = vec![
        Array::scalar_string("hello"),
        Array::from_strings([3], words.clone())?,
    ];
    let outputs: Vec<StubOutput> = expected.iter().map(StubOutput::array).collect();
    assert_eq!(outputs[0].bytes.len(), 9 + "hello".len());
    engine.respond_with(move |_| RunResponse::Outputs(outputs.clone()));

    let result = session.run(Fetch::list(["word:0", "words:0"]), &FeedDict::new())?;
    let values = result.flatten();
    assert_eq!(values[0].rank(), 0);
    assert_eq!(values[0].as_strings(), Some(&["hello".to_string()][..]));
    assert_eq!(values[1].as_strings(), Some(words.as_slice()));
    Ok(())
}

#[test]
fn string_feed_reaches_engine_in_native_layout() -> Result<()> {
    let engine = engine();
    let def = GraphDef::new()
        .tensor_op("text", DType::String, Some(&[]))
        .tensor_op("len", DType::Int32, Some(&[]));
    let session = open(&engine, &def)?;
    let text = session.graph().tensor_by_name("text:0")?;

    let feeds = FeedDict::new().with(&text, Array::scalar_string("abc"));
    session.run("len:0", &feeds)?;

    let run = engine.last_run().expect("run recorded");
    let bytes = &run.feeds[0].bytes;
    assert_eq!(bytes.len(), 12);
    assert_eq!(&bytes[..8], &0u64.to_ne_bytes());
    assert_eq!(bytes[8], 3);
    assert_eq!(&bytes[9..], b"abc");
    Ok(())
}

#[test]
fn string_feed_is_rejected_when_engine_uses_tstring_layout() -> Result<()> {
    let engine = engine();
    engine.set_string_layout(StringLayout::TString);
    let def = GraphDef::new()
        .tensor_op("text", DType::String, Some(&[]))
        .tensor_op("len", DType::Int32, Some(&[]));
    let session = open(&engine, &def)?;
    let text = session.graph().tensor_by_name("text:0")?;
    let allocations = engine.tensor_allocations();

    let feeds = FeedDict::new().with(&text, Array::scalar_string("abc"));
    let err = session.run("len:0", &feeds).unwrap_err();
    match err {
        Error::UnsupportedDtype { dtype, tensor } => {
            assert!(dtype.contains("tstring"));
            assert_eq!(tensor.as_deref(), Some("text:0"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.run_count(), 0);
    assert_eq!(engine.tensor_allocations(), allocations);

    session.run("len:0", &FeedDict::new())?;
    assert_eq!(engine.run_count(), 1);
    Ok(())
}

#[test]
fn string_output_is_rejected_when_engine_uses_tstring_layout() -> Result<()> {
    let engine = engine();
    engine.set_string_layout(StringLayout::TString);
    let def = GraphDef::new()
        .tensor_op("word", DType::String, Some(&[2]))
        .tensor_op("count", DType::Int32, Some(&[]));
    let session = open(&engine, &def)?;

    let err = session
        .run(Fetch::list(["count:0", "word:0"]), &FeedDict::new())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::UnsupportedDtype { tensor: Some(ref name), .. } if name == "word:0"
    ));
    assert_eq!(engine.live_tensors(), 0);
    assert_eq!(engine.double_frees(), 0);
    Ok(())
}
