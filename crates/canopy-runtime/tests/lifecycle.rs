//! In-memory actor behaviour: dispatch, forwarding, lifecycle order,
//! tree and metrics.

use canopy_runtime::{
    ActorError, ActorSystem, CreateOptions, Handlers, Msg, SystemOptions,
};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn test_system() -> ActorSystem {
    ActorSystem::new(SystemOptions {
        test: true,
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_send_mutates_external_state() {
    let system = test_system();
    let root = system.root_actor().await.unwrap();

    let ext_state = Arc::new(AtomicI64::new(0));
    let captured = ext_state.clone();
    let child = root
        .create_child(
            Handlers::new().on("myMessage", move |args: Vec<Msg>| {
                let state = captured.clone();
                async move {
                    let count = args[0]
                        .value()
                        .and_then(|v| v["count"].as_i64())
                        .unwrap_or(0);
                    state.fetch_add(count, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
            CreateOptions::default(),
        )
        .await
        .unwrap();

    child
        .send("myMessage", vec![Msg::from(json!({"count": 3}))])
        .await
        .unwrap();

    // Fire-and-forget handlers run on a spawned task.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ext_state.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_send_and_receive_returns_handler_value() {
    let system = test_system();
    let child = system
        .create_actor(
            Handlers::new().on("howMany", |args: Vec<Msg>| async move {
                let len = args[0]
                    .value()
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0);
                Ok(json!(len))
            }),
            CreateOptions::default(),
        )
        .await
        .unwrap();

    let reply = child
        .send_and_receive("howMany", vec![Msg::from(json!([1, 2, 3]))])
        .await
        .unwrap();
    assert_eq!(reply, json!(3));
}

#[tokio::test]
async fn test_variadic_arguments() {
    let system = test_system();
    let child = system
        .create_actor(
            Handlers::new().on("sayHello", |args: Vec<Msg>| async move {
                let to = args[0].as_str().unwrap_or("?").to_string();
                let from = args[1].as_str().unwrap_or("?").to_string();
                Ok(json!(format!("Hello to {to} from {from}")))
            }),
            CreateOptions::default(),
        )
        .await
        .unwrap();

    let reply = child
        .send_and_receive("sayHello", vec![Msg::from("Bob"), Msg::from("Jack")])
        .await
        .unwrap();
    assert_eq!(reply, json!("Hello to Bob from Jack"));
}

#[tokio::test]
async fn test_forward_to_parent_through_two_levels() {
    let system = test_system();
    let root = system.root_actor().await.unwrap();

    let result = Arc::new(AtomicI64::new(0));
    let plus_state = result.clone();
    let times_state = result.clone();
    let parent = root
        .create_child(
            Handlers::new()
                .on("plus", move |args: Vec<Msg>| {
                    let state = plus_state.clone();
                    async move {
                        state.fetch_add(args[0].as_i64().unwrap_or(0), Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                })
                .on("times", move |args: Vec<Msg>| {
                    let state = times_state.clone();
                    async move {
                        let factor = args[0].as_i64().unwrap_or(1);
                        let mut current = state.load(Ordering::SeqCst);
                        loop {
                            match state.compare_exchange(
                                current,
                                current * factor,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            ) {
                                Ok(_) => break,
                                Err(seen) => current = seen,
                            }
                        }
                        Ok(Value::Null)
                    }
                }),
            CreateOptions::default(),
        )
        .await
        .unwrap();

    let child = parent
        .create_child(Handlers::new(), CreateOptions::default())
        .await
        .unwrap();
    child.forward_to_parent(["plus", "times"]).unwrap();

    let grandchild = child
        .create_child(Handlers::new(), CreateOptions::default())
        .await
        .unwrap();
    grandchild.forward_to_parent(["plus", "times"]).unwrap();

    // (0 + 2) * 3 = 6, via two levels of forwarding.
    grandchild
        .send_and_receive("plus", vec![Msg::from(2)])
        .await
        .unwrap();
    grandchild
        .send_and_receive("times", vec![Msg::from(3)])
        .await
        .unwrap();
    assert_eq!(result.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_forward_all_unknown_to_parent() {
    let system = test_system();
    let root = system.root_actor().await.unwrap();

    let parent = root
        .create_child(
            Handlers::new().on("fallback", |_args: Vec<Msg>| async move {
                Ok(json!("from parent"))
            }),
            CreateOptions::default(),
        )
        .await
        .unwrap();

    let child = parent
        .create_child(
            Handlers::new().on("known", |_args: Vec<Msg>| async move { Ok(json!("from child")) }),
            CreateOptions::default(),
        )
        .await
        .unwrap();
    child.forward_all_unknown_to_parent().unwrap();

    // An explicit handler beats the unknown-topic fallback.
    let known = child.send_and_receive("known", vec![]).await.unwrap();
    assert_eq!(known, json!("from child"));

    let unknown = child.send_and_receive("fallback", vec![]).await.unwrap();
    assert_eq!(unknown, json!("from parent"));
}

#[tokio::test]
async fn test_forward_to_child_transparency() {
    let system = test_system();
    let root = system.root_actor().await.unwrap();

    let parent = root
        .create_child(Handlers::new(), CreateOptions::default())
        .await
        .unwrap();
    let worker = parent
        .create_child(
            Handlers::new().on("work", |args: Vec<Msg>| async move {
                Ok(json!(args[0].as_i64().unwrap_or(0) * 10))
            }),
            CreateOptions::named("worker"),
        )
        .await
        .unwrap();
    parent.forward_to_child(&worker, ["work"]).unwrap();

    let via_parent = parent
        .send_and_receive("work", vec![Msg::from(4)])
        .await
        .unwrap();
    let direct = worker
        .send_and_receive("work", vec![Msg::from(4)])
        .await
        .unwrap();
    assert_eq!(via_parent, direct);

    // A stranger actor cannot be a forward target.
    let stranger = root
        .create_child(Handlers::new(), CreateOptions::default())
        .await
        .unwrap();
    assert!(parent.forward_to_child(&stranger, ["work"]).is_err());
}

#[tokio::test]
async fn test_regex_forwarding() {
    let system = test_system();
    let root = system.root_actor().await.unwrap();

    let parent = root
        .create_child(
            Handlers::new().on("math.add", |_args: Vec<Msg>| async move { Ok(json!("added")) }),
            CreateOptions::default(),
        )
        .await
        .unwrap();
    let child = parent
        .create_child(Handlers::new(), CreateOptions::default())
        .await
        .unwrap();
    child
        .forward_to_parent([regex::Regex::new("^math\\.").unwrap()])
        .unwrap();

    let reply = child.send_and_receive("math.add", vec![]).await.unwrap();
    assert_eq!(reply, json!("added"));
}

#[tokio::test]
async fn test_send_before_initialize_completes_fails() {
    let system = test_system();
    let root = system.root_actor().await.unwrap();

    let observed: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let captured = observed.clone();
    let _child = root
        .create_child(
            Handlers::new()
                .on("noop", |_args: Vec<Msg>| async move { Ok(Value::Null) })
                .on_initialize(move |actor| {
                    let observed = captured.clone();
                    async move {
                        // The actor is still `new` here; sends must fail.
                        let err = actor.send_and_receive("noop", vec![]).await.unwrap_err();
                        *observed.lock().unwrap() = Some(err.to_string());
                        Ok(())
                    }
                }),
            CreateOptions::default(),
        )
        .await
        .unwrap();

    let message = observed.lock().unwrap().clone().expect("hook did not run");
    assert!(message.contains("Actor has not yet been initialized"));
}

#[tokio::test]
async fn test_no_handler_error() {
    let system = test_system();
    let child = system
        .create_actor(Handlers::new(), CreateOptions::default())
        .await
        .unwrap();

    let err = child.send_and_receive("missing", vec![]).await.unwrap_err();
    assert!(matches!(err, ActorError::NoHandler(_)));
    assert!(err.to_string().contains("No handler for message"));
}

#[tokio::test]
async fn test_handler_error_propagates_on_receive_only() {
    let system = test_system();
    let child = system
        .create_actor(
            Handlers::new().on("explode", |_args: Vec<Msg>| async move {
                Err(ActorError::Handler("boom".to_string()))
            }),
            CreateOptions::default(),
        )
        .await
        .unwrap();

    // With receive, the error surfaces.
    let err = child.send_and_receive("explode", vec![]).await.unwrap_err();
    assert_eq!(err.to_string(), "boom");

    // Without receive, it is logged and swallowed.
    child.send("explode", vec![]).await.unwrap();
}

#[tokio::test]
async fn test_destroy_runs_hooks_in_post_order() {
    let system = test_system();
    let root = system.root_actor().await.unwrap();

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let tag = |name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>| {
        let log = log.clone();
        Handlers::new().on_destroy(move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name);
                Ok(())
            }
        })
    };

    let parent = root
        .create_child(tag("parent", &order), CreateOptions::default())
        .await
        .unwrap();
    let first = parent
        .create_child(tag("first", &order), CreateOptions::default())
        .await
        .unwrap();
    let _grandchild = first
        .create_child(tag("grandchild", &order), CreateOptions::default())
        .await
        .unwrap();
    let _second = parent
        .create_child(tag("second", &order), CreateOptions::default())
        .await
        .unwrap();

    parent.destroy().await.unwrap();

    let order = order.lock().unwrap().clone();
    // Reverse insertion order among siblings, descendants before parents.
    assert_eq!(order, vec!["second", "grandchild", "first", "parent"]);
    assert_eq!(parent.state(), canopy_runtime::ActorState::Destroyed);

    let err = parent.send_and_receive("anything", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("destroyed"));
}

#[tokio::test]
async fn test_metrics_merge_and_destroyed_child_exclusion() {
    let system = test_system();
    let root = system.root_actor().await.unwrap();

    let parent = root
        .create_child(
            Handlers::new().with_metrics(|| {
                let mut map = Map::new();
                map.insert("parentMetric".to_string(), json!(111));
                map
            }),
            CreateOptions::default(),
        )
        .await
        .unwrap();

    let _child1 = parent
        .create_child(
            Handlers::new().with_metrics(|| {
                let mut map = Map::new();
                map.insert("childMetric".to_string(), json!(222));
                map
            }),
            CreateOptions::named("Child1"),
        )
        .await
        .unwrap();
    let child2 = parent
        .create_child(
            Handlers::new().with_metrics(|| {
                let mut map = Map::new();
                map.insert("childMetric".to_string(), json!(333));
                map
            }),
            CreateOptions::named("Child2"),
        )
        .await
        .unwrap();

    let metrics = parent.metrics().await.unwrap();
    assert_eq!(metrics["parentMetric"], json!(111));
    assert_eq!(metrics["Child1"]["childMetric"], json!(222));
    assert_eq!(metrics["Child2"]["childMetric"], json!(333));

    child2.destroy().await.unwrap();
    let metrics = parent.metrics().await.unwrap();
    assert!(metrics.get("Child2").is_none());
    assert_eq!(metrics["Child1"]["childMetric"], json!(222));
}

#[tokio::test]
async fn test_tree_reflects_live_descendants() {
    let system = test_system();
    let root = system.root_actor().await.unwrap();

    let parent = root
        .create_child(Handlers::new(), CreateOptions::named("parent"))
        .await
        .unwrap();
    let child = parent
        .create_child(Handlers::new(), CreateOptions::named("child"))
        .await
        .unwrap();
    let _grandchild = child
        .create_child(Handlers::new(), CreateOptions::named("grandchild"))
        .await
        .unwrap();

    let tree = parent.tree().await.unwrap();
    assert_eq!(tree.name, "parent");
    assert_eq!(tree.id, parent.id().to_string());
    let children = tree.children.as_ref().unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].name, "child");
    assert_eq!(children[0].children.as_ref().unwrap()[0].name, "grandchild");

    child.destroy().await.unwrap();
    let tree = parent.tree().await.unwrap();
    assert!(tree.children.is_none());
}

#[tokio::test]
async fn test_send_and_receive_timeout() {
    let system = test_system();
    let child = system
        .create_actor(
            Handlers::new().on("slow", |_args: Vec<Msg>| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!("too late"))
            }),
            CreateOptions::default(),
        )
        .await
        .unwrap();

    let err = child
        .send_and_receive_timeout("slow", vec![], Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ActorError::Timeout));
    assert_eq!(err.to_string(), "Response timed out.");
}

#[tokio::test]
async fn test_in_memory_cluster_round_robin() {
    let system = test_system();
    let root = system.root_actor().await.unwrap();

    canopy_runtime::register_behavior("lifecycle-counter", |_resources| {
        let calls = Arc::new(AtomicI64::new(0));
        Box::new(Handlers::new().on("bump", move |_args: Vec<Msg>| {
            let calls = calls.clone();
            async move { Ok(json!(calls.fetch_add(1, Ordering::SeqCst) + 1)) }
        }))
    });

    let cluster = root
        .create_child(
            "lifecycle-counter",
            CreateOptions {
                name: Some("counters".to_string()),
                cluster_size: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Each replica keeps its own count: six rotating sends touch each
    // replica exactly twice.
    for _ in 0..6 {
        cluster.send_and_receive("bump", vec![]).await.unwrap();
    }
    let counts = cluster.broadcast_and_receive("bump", vec![]).await.unwrap();
    assert_eq!(counts, vec![json!(3), json!(3), json!(3)]);
}
