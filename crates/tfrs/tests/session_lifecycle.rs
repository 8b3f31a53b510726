use std::sync::Arc;
use std::thread;

use anyhow::Result;
use tfrs::{Array, DType, EngineApi, Error, FeedDict, Graph, Session, SessionConfig};
use tfrs_backend_tests::{stub_graph, GraphDef, StubEngine};

fn graph_def() -> GraphDef {
    GraphDef::new()
        .tensor_op("x", DType::Int32, Some(&[]))
        .tensor_op("y", DType::Int32, Some(&[]))
}

fn assert_nothing_live(engine: &StubEngine) {
    assert_eq!(engine.live_tensors(), 0, "tensors leaked");
    assert_eq!(engine.live_statuses(), 0, "statuses leaked");
    assert_eq!(engine.live_sessions(), 0, "sessions leaked");
    assert_eq!(engine.live_options(), 0, "session options leaked");
    assert_eq!(engine.live_graphs(), 0, "graphs leaked");
    assert_eq!(engine.double_frees(), 0);
}

#[test]
fn close_is_idempotent_and_frees_everything_once() -> Result<()> {
    let engine = Arc::new(StubEngine::new());
    let graph = stub_graph(&engine, &graph_def());
    let session = Session::new(Arc::clone(&graph), SessionConfig::default())?;
    assert_eq!(engine.live_options(), 0);
    session.run("y:0", &FeedDict::new())?;

    session.close()?;
    assert!(session.is_closed());
    session.close()?;
    assert_eq!(engine.close_calls(), 1);

    drop(session);
    drop(graph);
    assert_nothing_live(&engine);
    Ok(())
}

#[test]
fn run_after_close_makes_no_foreign_call() -> Result<()> {
    let engine = Arc::new(StubEngine::new());
    let session = Session::new(stub_graph(&engine, &graph_def()), SessionConfig::default())?;
    let x = session.graph().tensor_by_name("x:0")?;
    session.close()?;
    let allocations = engine.tensor_allocations();

    let feeds = FeedDict::new().with(&x, Array::scalar(1i32));
    let err = session.run("y:0", &feeds).unwrap_err();
    assert!(matches!(err, Error::UseAfterClose));
    assert_eq!(engine.run_count(), 0);
    assert_eq!(engine.tensor_allocations(), allocations);
    Ok(())
}

#[test]
fn drop_closes_an_open_session() -> Result<()> {
    let engine = Arc::new(StubEngine::new());
    {
        let session = Session::new(stub_graph(&engine, &graph_def()), SessionConfig::default())?;
        session.run("y:0", &FeedDict::new())?;
    }
    assert_eq!(engine.close_calls(), 1);
    assert_nothing_live(&engine);
    Ok(())
}

#[test]
fn failed_close_still_releases_the_session() -> Result<()> {
    let engine = Arc::new(StubEngine::new());
    let session = Session::new(stub_graph(&engine, &graph_def()), SessionConfig::default())?;
    engine.fail_close("connection reset");

    let err = session.close().unwrap_err();
    assert!(matches!(err, Error::Close { ref message } if message == "connection reset"));
    assert!(session.is_closed());
    session.close()?;

    drop(session);
    assert_nothing_live(&engine);
    Ok(())
}

#[test]
fn open_failure_is_engine_open_and_leaks_nothing() -> Result<()> {
    let engine = Arc::new(StubEngine::new());
    let graph = stub_graph(&engine, &graph_def());
    engine.fail_next_open("no devices available");

    let err = match Session::new(Arc::clone(&graph), SessionConfig::default()) {
        Ok(_) => panic!("open must fail"),
        Err(err) => err,
    };
    assert!(matches!(err, Error::EngineOpen { ref message } if message == "no devices available"));

    drop(graph);
    assert_nothing_live(&engine);
    Ok(())
}

#[test]
fn config_is_forwarded_to_the_engine() -> Result<()> {
    let engine = Arc::new(StubEngine::new());
    let graph = stub_graph(&engine, &graph_def());
    let config = SessionConfig::default()
        .with_target("grpc://worker:2222")
        .with_config(vec![0x32, 0x02, 0x20, 0x01]);
    let _session = Session::new(graph, config)?;

    let opened = engine.opened_sessions();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].target.as_deref(), Some("grpc://worker:2222"));
    assert_eq!(opened[0].config.as_deref(), Some(&[0x32, 0x02, 0x20, 0x01][..]));
    Ok(())
}

#[test]
fn rejected_config_fails_open() -> Result<()> {
    let engine = Arc::new(StubEngine::new());
    let graph = stub_graph(&engine, &graph_def());

    let config = SessionConfig::default().with_config(vec![0xff]);
    let err = match Session::new(Arc::clone(&graph), config) {
        Ok(_) => panic!("open must fail"),
        Err(err) => err,
    };
    assert!(matches!(err, Error::EngineOpen { .. }));
    assert!(engine.opened_sessions().is_empty());

    drop(graph);
    assert_nothing_live(&engine);
    Ok(())
}

#[test]
fn graph_changes_are_pushed_once_per_version() -> Result<()> {
    let engine = Arc::new(StubEngine::new());
    let graph = stub_graph(&engine, &graph_def());
    let session = Session::new(Arc::clone(&graph), SessionConfig::default())?;

    session.run("y:0", &FeedDict::new())?;
    assert_eq!(engine.extend_calls(), 0);

    graph.import_graph_def(&GraphDef::new().tensor_op("z", DType::Float, Some(&[])).to_bytes())?;
    session.run("z:0", &FeedDict::new())?;
    session.run("z:0", &FeedDict::new())?;
    assert_eq!(engine.extend_calls(), 1);

    graph.mark_modified();
    session.run("y:0", &FeedDict::new())?;
    assert_eq!(engine.extend_calls(), 2);
    Ok(())
}

#[test]
fn import_errors_surface_as_native_errors() -> Result<()> {
    let engine = Arc::new(StubEngine::new());
    let api: Arc<dyn EngineApi> = Arc::clone(&engine) as Arc<dyn EngineApi>;
    let graph = Graph::new(api)?;
    graph.import_graph_def(&graph_def().to_bytes())?;
    let version = graph.version();

    let err = graph.import_graph_def(&graph_def().to_bytes()).unwrap_err();
    assert!(matches!(err, Error::Native { call: "import_graph_def", .. }));
    let err = graph.import_graph_def(b"not a graph").unwrap_err();
    assert!(matches!(err, Error::Native { .. }));
    assert_eq!(graph.version(), version);

    graph.import_graph_def_with_prefix(&graph_def().to_bytes(), "copy")?;
    assert!(graph.operation_by_name("copy/y").is_some());
    Ok(())
}

#[test]
fn concurrent_runs_share_one_session() -> Result<()> {
    let engine = Arc::new(StubEngine::new());
    let session = Arc::new(Session::new(
        stub_graph(&engine, &graph_def()),
        SessionConfig::default(),
    )?);
    let x = session.graph().tensor_by_name("x:0")?;

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let session = Arc::clone(&session);
            let x = x.clone();
            thread::spawn(move || {
                let feeds = FeedDict::new().with(&x, Array::scalar(i as i32));
                for _ in 0..10 {
                    session.run("y:0", &feeds).expect("run succeeds");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    assert_eq!(engine.run_count(), 40);
    assert_eq!(engine.live_tensors(), 0);
    Ok(())
}
