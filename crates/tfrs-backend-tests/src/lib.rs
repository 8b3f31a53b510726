//! Test doubles and shared checks for `tfrs` engines.

pub mod graph_def;
pub mod smoke;
pub mod stub_engine;

use std::sync::Arc;

use tfrs::{EngineApi, Graph};

pub use graph_def::{GraphDef, OpDef, OutputDef};
pub use stub_engine::{FedValue, OpenedSession, RunRequest, RunResponse, StubEngine, StubOutput};

/// Builds a graph on `engine` from a stub graph definition.
pub fn stub_graph(engine: &Arc<StubEngine>, def: &GraphDef) -> Arc<Graph> {
    let api: Arc<dyn EngineApi> = Arc::clone(engine) as Arc<dyn EngineApi>;
    let graph = Graph::new(api).expect("stub graph allocates");
    graph
        .import_graph_def(&def.to_bytes())
        .expect("stub graph def imports");
    Arc::new(graph)
}

#[macro_export]
macro_rules! define_engine_tests {
    ($module:ident, $engine_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use std::sync::Arc;

            use $crate::smoke;

            fn engine() -> Option<Arc<dyn tfrs::EngineApi>> {
                ($engine_ctor)()
            }

            macro_rules! smoke_test {
                ($name:ident) => {
                    #[test]
                    fn $name() {
                        let Some(api) = engine() else {
                            eprintln!("skipping {}: engine unavailable", stringify!($name));
                            return;
                        };
                        smoke::$name(&api);
                    }
                };
            }

            smoke_test!(status_starts_ok);
            smoke_test!(numeric_buffer_roundtrip);
            smoke_test!(string_buffer_roundtrip);
            smoke_test!(missing_operation_is_none);
            smoke_test!(empty_graph_session_closes_once);
        }
    };
}

define_engine_tests!(stub_engine_smoke, || Some(
    Arc::new(StubEngine::new()) as Arc<dyn EngineApi>
));
