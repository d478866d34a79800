//! End-to-end call engine tests over the loopback transport.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lattice_core::{code, Object};
use lattice_runtime::context::BUILTIN_INTERFACE;
use lattice_runtime::{
    client, loopback, service, CallResponse, CallStatus, Context, InboundCall, Server,
    ServerEvent,
};
use lattice_typing::TypingContext;

fn trace_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn write_idl(name: &str, contents: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("lattice-engine-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

async fn single(conn: &lattice_runtime::Connection, interface: &str, method: &str, args: Object) -> Object {
    match conn.call_sync("/", interface, method, args).await.unwrap() {
        CallResponse::Single(obj) => obj,
        CallResponse::Stream(_) => panic!("unexpected streaming response"),
    }
}

#[tokio::test]
async fn test_ping() {
    trace_init();
    loopback::register();
    let ctx = Context::new();
    let server = Server::create("loopback://ping", &ctx).await.unwrap();

    let conn = client::connect("loopback://ping").await.unwrap();
    let result = single(&conn, BUILTIN_INTERFACE, "ping", Object::array()).await;
    assert!(result.is_null());

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_method_not_found() {
    loopback::register();
    let ctx = Context::new();
    let server = Server::create("loopback://notfound", &ctx).await.unwrap();

    let conn = client::connect("loopback://notfound").await.unwrap();
    let err = conn
        .call_sync("/", "com.example.Nope", "missing", Object::array())
        .await
        .unwrap_err();
    assert_eq!(err.code, code::ENOENT);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_instance_path() {
    loopback::register();
    let ctx = Context::new();
    let server = Server::create("loopback://nopath", &ctx).await.unwrap();

    let conn = client::connect("loopback://nopath").await.unwrap();
    let err = conn
        .call_sync("/missing", BUILTIN_INTERFACE, "ping", Object::array())
        .await
        .unwrap_err();
    assert_eq!(err.code, code::ENOENT);
    assert!(err.message.contains("/missing"));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_typed_arguments() {
    loopback::register();

    let idl = write_idl(
        "calc.yaml",
        "
meta:
  version: 1
  namespace: com.example
interface Calculator:
  method add:
    args:
      - {name: a, type: int64}
      - {name: b, type: int64}
    return: {type: int64}
",
    );
    let typing = TypingContext::new();
    typing.load_types(&idl).unwrap();

    let ctx = Context::new();
    ctx.attach_typing(typing);

    let invoked = Arc::new(AtomicBool::new(false));
    {
        let invoked = invoked.clone();
        ctx.register_func("com.example.Calculator.add", "Adds two integers", move |_call, args| {
            invoked.store(true, Ordering::SeqCst);
            async move {
                let a = args.array_get(0).and_then(|o| o.as_int64()).unwrap_or(0);
                let b = args.array_get(1).and_then(|o| o.as_int64()).unwrap_or(0);
                Ok(Object::int64(a + b))
            }
        });
    }

    let server = Server::create("loopback://calc", &ctx).await.unwrap();
    let conn = client::connect("loopback://calc").await.unwrap();

    let result = single(
        &conn,
        "com.example.Calculator",
        "add",
        Object::array_from([Object::int64(2), Object::int64(3)]),
    )
    .await;
    assert_eq!(result, Object::int64(5));
    assert!(invoked.load(Ordering::SeqCst));

    // A mistyped argument is rejected before the implementation runs.
    invoked.store(false, Ordering::SeqCst);
    let err = conn
        .call_sync(
            "/",
            "com.example.Calculator",
            "add",
            Object::array_from([Object::string("x"), Object::int64(3)]),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code, code::EINVAL);
    assert!(err.message.starts_with("Validation failed"));
    let entry = err.extra.unwrap().array_get(0).unwrap();
    assert_eq!(entry.dict_get("path").unwrap().as_str(), Some(".0"));
    assert_eq!(
        entry.dict_get("message").unwrap().as_str(),
        Some("Incompatible type string, should be int64")
    );
    assert!(!invoked.load(Ordering::SeqCst));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_return_validation() {
    loopback::register();

    let idl = write_idl(
        "ret.yaml",
        "
meta:
  version: 1
  namespace: com.example
interface Clock:
  method now:
    return: {type: int64}
",
    );
    let typing = TypingContext::new();
    typing.load_types(&idl).unwrap();

    let ctx = Context::new();
    ctx.attach_typing(typing);
    ctx.register_func("com.example.Clock.now", "Returns the wrong type", |_call, _args| async {
        Ok(Object::string("noon"))
    });

    let server = Server::create("loopback://retval", &ctx).await.unwrap();
    let conn = client::connect("loopback://retval").await.unwrap();

    let err = conn
        .call_sync("/", "com.example.Clock", "now", Object::array())
        .await
        .unwrap_err();
    assert_eq!(err.code, code::EINVAL);
    assert_eq!(err.message, "Return value validation failed");
    assert!(err.extra.is_some());

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_streaming() {
    loopback::register();
    let ctx = Context::new();
    ctx.register_func("com.example.Stream.numbers", "Yields 1, 2, 3", |call, _args| async move {
        for i in 1..=3 {
            call.yield_fragment(Object::int64(i)).await?;
        }
        Ok(Object::null())
    });

    let server = Server::create("loopback://stream", &ctx).await.unwrap();
    let conn = client::connect("loopback://stream").await.unwrap();

    let response = conn
        .call_sync("/", "com.example.Stream", "numbers", Object::array())
        .await
        .unwrap();

    let mut stream = match response {
        CallResponse::Stream(stream) => stream,
        CallResponse::Single(_) => panic!("expected a stream"),
    };

    let mut got = Vec::new();
    while let Some(item) = stream.next().await {
        got.push(item.unwrap().as_int64().unwrap());
    }
    assert_eq!(got, vec![1, 2, 3]);
    assert_eq!(stream.status(), CallStatus::Done);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_timeout_aborts_server_side() {
    loopback::register();
    let ctx = Context::new();

    let slot: Arc<Mutex<Option<Arc<InboundCall>>>> = Arc::new(Mutex::new(None));
    {
        let slot = slot.clone();
        ctx.register_func("com.example.Slow.sleep", "Sleeps half a second", move |call, _args| {
            slot.lock().unwrap().replace(call);
            async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(Object::null())
            }
        });
    }

    let server = Server::create("loopback://slow", &ctx).await.unwrap();
    let conn = client::ClientBuilder::new()
        .default_timeout(Duration::from_millis(50))
        .connect("loopback://slow")
        .await
        .unwrap();

    let err = conn
        .call_sync("/", "com.example.Slow", "sleep", Object::array())
        .await
        .unwrap_err();
    assert_eq!(err.code, code::ETIMEDOUT);

    // The inbound call observes the cancellation shortly after expiry.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let inbound = slot.lock().unwrap().clone().unwrap();
    assert!(inbound.is_aborted());

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_event_broadcast() {
    loopback::register();
    let ctx = Context::new();
    let server = Server::create("loopback://bus", &ctx).await.unwrap();

    let mut conns = Vec::new();
    let mut counters = Vec::new();
    for _ in 0..2 {
        let conn = client::connect("loopback://bus").await.unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        {
            let count = count.clone();
            let seen = seen.clone();
            conn.subscribe(
                "/",
                "com.ex.Bus",
                "tick",
                Arc::new(move |args: &Object| {
                    count.fetch_add(1, Ordering::SeqCst);
                    seen.lock().unwrap().replace(args.clone());
                }),
            )
            .await
            .unwrap();
        }
        // A round trip guarantees the server registered this connection.
        let _ = single(&conn, BUILTIN_INTERFACE, "ping", Object::array()).await;
        conns.push(conn);
        counters.push((count, seen));
    }
    assert_eq!(server.connection_count(), 2);

    server.broadcast_event("/", "com.ex.Bus", "tick", Object::int64(42)).await;
    // An event nobody subscribed to is filtered out.
    server.broadcast_event("/", "com.ex.Bus", "tock", Object::int64(7)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    for (count, seen) in &counters {
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap().clone().unwrap(), Object::int64(42));
    }

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_call_async_callback() {
    loopback::register();
    let ctx = Context::new();
    ctx.register_func("com.example.Echo.echo", "Echoes its argument", |_call, args| async move {
        Ok(args.array_get(0).unwrap_or_else(Object::null))
    });

    let server = Server::create("loopback://cb", &ctx).await.unwrap();
    let conn = client::connect("loopback://cb").await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let call = conn
        .call_async(
            "/",
            "com.example.Echo",
            "echo",
            Object::array_from([Object::string("hey")]),
            move |status, value| {
                let _ = tx.send((status, value));
            },
        )
        .await
        .unwrap();

    let (status, value) = rx.recv().await.unwrap();
    assert_eq!(status, CallStatus::Done);
    assert_eq!(value.unwrap(), Object::string("hey"));
    assert_eq!(call.status(), CallStatus::Done);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_response_dropped() {
    loopback::register();
    let ctx = Context::new();
    ctx.register_func("com.example.Dup.answer", "Responds explicitly", |call, _args| async move {
        call.respond(Object::int64(1)).await;
        // The implicit response from the returned value is dropped.
        Ok(Object::int64(2))
    });

    let server = Server::create("loopback://dup", &ctx).await.unwrap();
    let conn = client::connect("loopback://dup").await.unwrap();

    let result = single(&conn, "com.example.Dup", "answer", Object::array()).await;
    assert_eq!(result, Object::int64(1));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_connection_close_fails_outstanding_calls() {
    loopback::register();
    let ctx = Context::new();
    ctx.register_func("com.example.Hang.forever", "Never responds", |_call, _args| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Object::null())
    });

    let server = Server::create("loopback://hang", &ctx).await.unwrap();
    let conn = client::connect("loopback://hang").await.unwrap();

    let call = conn
        .call("/", "com.example.Hang", "forever", Object::array())
        .await
        .unwrap();
    conn.close().await;

    let err = call.result().await.unwrap_err();
    assert_eq!(err.code, code::ECONNRESET);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_server_lifecycle_events() {
    loopback::register();
    let ctx = Context::new();
    let server = Server::create("loopback://lifecycle", &ctx).await.unwrap();

    let arrived = Arc::new(AtomicUsize::new(0));
    let terminated = Arc::new(AtomicUsize::new(0));
    {
        let arrived = arrived.clone();
        let terminated = terminated.clone();
        server.set_event_handler(Box::new(move |_conn, event| match event {
            ServerEvent::ConnectionArrived => {
                arrived.fetch_add(1, Ordering::SeqCst);
            }
            ServerEvent::ConnectionTerminated => {
                terminated.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    let conn = client::connect("loopback://lifecycle").await.unwrap();
    let _ = single(&conn, BUILTIN_INTERFACE, "ping", Object::array()).await;
    assert_eq!(arrived.load(Ordering::SeqCst), 1);
    assert_eq!(server.connection_count(), 1);

    conn.close().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(terminated.load(Ordering::SeqCst), 1);
    assert_eq!(server.connection_count(), 0);

    server.close().await.unwrap();
    assert!(server.is_closed());

    // Closing twice fails: the server is no longer on its context.
    assert!(server.close().await.is_err());
}

#[tokio::test]
async fn test_connect_refused_without_listener() {
    loopback::register();
    let err = client::connect("loopback://nobody-home").await.unwrap_err();
    assert_eq!(err.code, code::ECONNREFUSED);
}

#[tokio::test]
async fn test_idl_download() {
    loopback::register();

    let idl = write_idl(
        "shapes.yaml",
        "
meta:
  version: 1
  namespace: com.shapes
struct Point:
  members:
    x: int64
    y: int64
",
    );
    let typing = TypingContext::new();
    typing.load_types(&idl).unwrap();

    let ctx = Context::new();
    ctx.attach_typing(typing.clone());
    service::allow_idl_download(&ctx, &typing);

    let server = Server::create("loopback://typing", &ctx).await.unwrap();
    let conn = client::connect("loopback://typing").await.unwrap();

    let local = TypingContext::new();
    let count = service::download_idl(&conn, &local).await.unwrap();
    assert_eq!(count, 1);

    // The downloaded document chain-loads on first lookup.
    let point = local.find_type("com.shapes.Point").unwrap();
    assert_eq!(point.name, "com.shapes.Point");

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_unregister_method() {
    let ctx = Context::new();
    ctx.register_func("com.example.Tmp.f", "", |_c, _a| async { Ok(Object::null()) });
    assert!(ctx.unregister_method("com.example.Tmp.f").is_ok());
    assert_eq!(
        ctx.unregister_method("com.example.Tmp.f").unwrap_err().code,
        code::ENOENT
    );
}
