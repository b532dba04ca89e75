//! End-to-end forked and remote modes with real worker processes.
//!
//! This suite runs without the libtest harness: `main` first calls
//! `worker::init()`, so when an actor spawns this binary as a worker the
//! child process serves its parent instead of re-running the tests.

use canopy_runtime::{
    register_behavior, ActorError, ActorRef, ActorSystem, CreateOptions, Handlers, Mode, Msg,
    SystemOptions,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

fn register_behaviors() {
    register_behavior("pm-hello", |_resources| {
        Box::new(Handlers::new().on("hello", |args: Vec<Msg>| async move {
            Ok(json!(format!("Hello {}!", args[0].as_i64().unwrap_or(0))))
        }))
    });

    register_behavior("pm-pid", |_resources| {
        Box::new(
            Handlers::new().on("pid", |_args: Vec<Msg>| async move {
                Ok(json!(std::process::id()))
            }),
        )
    });

    register_behavior("pm-reporter", |_resources| {
        let parent_slot: Arc<Mutex<Option<ActorRef>>> = Arc::new(Mutex::new(None));
        let init_slot = parent_slot.clone();
        Box::new(
            Handlers::new()
                .on_initialize(move |actor| {
                    let slot = init_slot.clone();
                    async move {
                        *slot.lock().unwrap() = actor.parent();
                        Ok(())
                    }
                })
                .on("trigger", move |args: Vec<Msg>| {
                    let slot = parent_slot.clone();
                    async move {
                        let parent = slot.lock().unwrap().clone().ok_or_else(|| {
                            ActorError::Config("reporter has no parent".to_string())
                        })?;
                        parent.send_and_receive("report", args).await
                    }
                }),
        )
    });

    register_behavior("pm-ref-caller", |_resources| {
        Box::new(Handlers::new().on("callRef", |args: Vec<Msg>| async move {
            let target = args[0]
                .actor()
                .cloned()
                .ok_or_else(|| ActorError::Config("expected an actor reference".to_string()))?;
            target.send_and_receive("ping", vec![]).await
        }))
    });
}

fn main() {
    register_behaviors();
    canopy_runtime::worker::init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async {
        forked_matches_in_memory().await;
        forked_child_messages_parent().await;
        forked_reference_marshalling().await;
        forked_cluster_spreads_processes().await;
        remote_round_trip().await;
    });
    println!("process_modes: all scenarios passed");
}

fn test_system() -> ActorSystem {
    ActorSystem::new(SystemOptions {
        test: true,
        ..Default::default()
    })
    .expect("system")
}

async fn forked_matches_in_memory() {
    let system = test_system();

    let local = system
        .create_actor("pm-hello", CreateOptions::named("HelloLocal"))
        .await
        .expect("local actor");
    let forked = system
        .create_actor(
            "pm-hello",
            CreateOptions::named("HelloForked").mode(Mode::Forked),
        )
        .await
        .expect("forked actor");
    assert_eq!(forked.mode(), Mode::Forked);

    let local_reply = local
        .send_and_receive("hello", vec![Msg::from(123)])
        .await
        .expect("local reply");
    let forked_reply = forked
        .send_and_receive("hello", vec![Msg::from(123)])
        .await
        .expect("forked reply");
    assert_eq!(local_reply, json!("Hello 123!"));
    assert_eq!(local_reply, forked_reply, "mode parity");

    let tree = forked.tree().await.expect("tree");
    assert_eq!(tree.location, Mode::Forked);
    assert_eq!(tree.id, forked.id().to_string());

    forked.destroy().await.expect("destroy forked");
    let err = forked
        .send_and_receive("hello", vec![Msg::from(1)])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("destroyed"));

    system.destroy().await.expect("destroy system");
    println!("  forked_matches_in_memory: ok");
}

async fn forked_child_messages_parent() {
    let system = test_system();
    let root = system.root_actor().await.expect("root");

    let parent = root
        .create_child(
            Handlers::new().on("report", |args: Vec<Msg>| async move {
                Ok(json!(args[0].as_i64().unwrap_or(0) * 2))
            }),
            CreateOptions::named("reporting-parent"),
        )
        .await
        .expect("parent");

    let reporter = parent
        .create_child(
            "pm-reporter",
            CreateOptions::named("reporter").mode(Mode::Forked),
        )
        .await
        .expect("reporter");

    // The worker-side handler round-trips through the host-side parent.
    let reply = reporter
        .send_and_receive("trigger", vec![Msg::from(21)])
        .await
        .expect("trigger");
    assert_eq!(reply, json!(42));

    system.destroy().await.expect("destroy system");
    println!("  forked_child_messages_parent: ok");
}

async fn forked_reference_marshalling() {
    let system = test_system();

    let pinger = system
        .create_actor(
            Handlers::new().on("ping", |_args: Vec<Msg>| async move { Ok(json!("pong")) }),
            CreateOptions::named("pinger"),
        )
        .await
        .expect("pinger");

    let caller = system
        .create_actor(
            "pm-ref-caller",
            CreateOptions::named("caller").mode(Mode::Forked),
        )
        .await
        .expect("caller");

    // The reference crosses into the worker and routes back over the
    // shared pipe bus.
    let reply = caller
        .send_and_receive("callRef", vec![Msg::from(pinger.clone())])
        .await
        .expect("callRef");
    assert_eq!(reply, json!("pong"));

    system.destroy().await.expect("destroy system");
    println!("  forked_reference_marshalling: ok");
}

async fn forked_cluster_spreads_processes() {
    let system = test_system();

    let cluster = system
        .create_actor(
            "pm-pid",
            CreateOptions {
                name: Some("pids".to_string()),
                mode: Some(Mode::Forked),
                cluster_size: Some(2),
                ..Default::default()
            },
        )
        .await
        .expect("cluster");

    let own_pid = json!(std::process::id());
    let first = cluster.send_and_receive("pid", vec![]).await.expect("pid 1");
    let second = cluster.send_and_receive("pid", vec![]).await.expect("pid 2");
    assert_ne!(first, own_pid);
    assert_ne!(second, own_pid);
    assert_ne!(first, second, "replicas run in distinct processes");

    let all: Vec<Value> = cluster
        .broadcast_and_receive("pid", vec![])
        .await
        .expect("broadcast");
    assert_eq!(all.len(), 2);
    assert_eq!(all[0], first);
    assert_eq!(all[1], second);

    system.destroy().await.expect("destroy system");
    println!("  forked_cluster_spreads_processes: ok");
}

async fn remote_round_trip() {
    let system = test_system();
    let bound = system
        .listen(Some(0), Some("127.0.0.1"))
        .await
        .expect("listen");

    let remote = system
        .create_actor(
            "pm-hello",
            CreateOptions {
                name: Some("HelloRemote".to_string()),
                mode: Some(Mode::Remote),
                hosts: vec![format!("127.0.0.1:{}", bound.port())],
                ..Default::default()
            },
        )
        .await
        .expect("remote actor");
    assert_eq!(remote.mode(), Mode::Remote);

    let reply = remote
        .send_and_receive("hello", vec![Msg::from(7)])
        .await
        .expect("remote reply");
    assert_eq!(reply, json!("Hello 7!"));

    remote.destroy().await.expect("destroy remote");
    system.destroy().await.expect("destroy system");
    println!("  remote_round_trip: ok");
}
