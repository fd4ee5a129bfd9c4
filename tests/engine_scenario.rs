//! End-to-end engine scenario: environment, graph, wiring, execution,
//! events, handles, and persistence working together

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nodeflow::{
    last_error, Env, FlowError, Graph, HandleRegistry, NodeData,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn constant_feeds_adder_through_a_connection() {
    init_logging();

    let env = Env::create(2).unwrap();
    let graph = Graph::create(&env);

    let a = graph.add_node("const.int", "A").unwrap();
    let b = graph.add_node("math.add", "B").unwrap();

    let connected_events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connected_events);
    let registration = graph.events().on_nodes_connected(move |conn| {
        assert_eq!(conn.source_port(), "out");
        assert_eq!(conn.target_port(), "lhs");
        counter.fetch_add(1, Ordering::SeqCst);
    });

    graph.connect(a.id(), "out", b.id(), "lhs").unwrap();
    assert_eq!(connected_events.load(Ordering::SeqCst), 1);

    b.set_input_data("rhs", NodeData::integer(5)).unwrap();
    graph.run().unwrap();
    env.wait();

    // A's constant defaults to 0, so B computes 0 + 5
    assert_eq!(
        b.get_output_data("out").unwrap(),
        Some(NodeData::integer(5))
    );

    registration.unregister().unwrap();
    assert!(!registration.is_valid());
}

#[test]
fn compute_events_arrive_from_worker_threads() {
    init_logging();

    let env = Env::create(4).unwrap();
    let graph = Graph::create(&env);

    let source = graph.add_node("const.int", "source").unwrap();
    source.set_input_data("value", NodeData::integer(2)).unwrap();

    let mut sinks = Vec::new();
    for i in 0..6 {
        let sink = graph.add_node("math.add", &format!("sink-{i}")).unwrap();
        sink.set_input_data("rhs", NodeData::integer(i)).unwrap();
        graph.connect(source.id(), "out", sink.id(), "lhs").unwrap();
        sinks.push(sink);
    }

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let mut registrations = Vec::new();
    for sink in &sinks {
        let seen = Arc::clone(&seen);
        let id = sink.id().to_string();
        registrations.push(sink.events().on_compute(move || {
            seen.lock().unwrap().push(id.clone());
        }));
    }

    graph.run().unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), sinks.len());
    for (i, sink) in sinks.iter().enumerate() {
        assert_eq!(
            sink.get_output_data("out").unwrap(),
            Some(NodeData::integer(2 + i as i32))
        );
    }
}

#[test]
fn engine_objects_round_trip_through_the_handle_registry() {
    init_logging();

    let env = Env::create(1).unwrap();
    let graph = Graph::create(&env);
    let node = graph.add_node("const.int", "A").unwrap();

    let registry = HandleRegistry::global();
    let graph_handle = registry.register(Arc::clone(&graph));
    let node_handle = registry.register(Arc::clone(&node));

    // A foreign caller resolves the graph handle and mutates through it
    let resolved = registry.resolve::<Graph>(graph_handle).unwrap();
    let b = resolved.add_node("math.add", "B").unwrap();
    resolved.connect(node.id(), "out", b.id(), "lhs").unwrap();

    registry.retain(node_handle).unwrap();
    assert_eq!(registry.ref_count(node_handle).unwrap(), 2);
    assert!(!registry.release(node_handle).unwrap());
    assert!(registry.release(node_handle).unwrap());
    assert!(!registry.is_valid(node_handle));

    // The node object itself stays alive: the graph still owns it
    assert_eq!(graph.nodes().len(), 2);

    assert!(registry.release(graph_handle).unwrap());
}

#[test]
fn failures_surface_in_results_and_the_last_error_slot() {
    init_logging();

    let env = Env::create(1).unwrap();
    let graph = Graph::create(&env);
    let b = graph.add_node("math.add", "B").unwrap();

    nodeflow::clear_last_error();
    let err = graph
        .connect("ghost", "out", b.id(), "lhs")
        .unwrap_err();
    assert!(matches!(err, FlowError::NodeNotFound(_)));

    let recorded = last_error().expect("failure recorded in last-error slot");
    assert_eq!(recorded.code(), err.code());
    assert_eq!(recorded.message(), err.message());

    nodeflow::clear_last_error();
    assert!(last_error().is_none());
}

#[test]
fn saved_graphs_reload_into_fresh_graphs() {
    init_logging();

    let env = Env::create(2).unwrap();
    let graph = Graph::create(&env);

    let a = graph.add_node("const.int", "A").unwrap();
    let b = graph.add_node("math.add", "B").unwrap();
    a.set_input_data("value", NodeData::integer(30)).unwrap();
    b.set_input_data("rhs", NodeData::integer(12)).unwrap();
    graph.connect(a.id(), "out", b.id(), "lhs").unwrap();

    let document = graph.save_to_json();

    let fresh = Graph::create(&env);
    fresh.load_from_json(&document).unwrap();
    fresh.run().unwrap();

    assert_eq!(
        fresh
            .get_node(b.id())
            .unwrap()
            .get_output_data("out")
            .unwrap(),
        Some(NodeData::integer(42))
    );
}
