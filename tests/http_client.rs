//! End-to-end client/server scenarios.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use tsrpc::{
    ApiCall, ApiReturn, CallApiOptions, DataType, ErrorType, FlowControl, HttpClient,
    HttpServer, LogLevel, ServiceProto, TsrpcError,
};

fn proto() -> ServiceProto {
    serde_json::from_value(json!({
        "services": [
            { "id": 0, "name": "Test", "type": "api" },
            { "id": 1, "name": "a/b/c/Test", "type": "api" },
            { "id": 2, "name": "Chat", "type": "msg" },
            { "id": 3, "name": "Slow", "type": "api" },
        ]
    }))
    .unwrap()
}

fn server_builder() -> tsrpc::HttpServerBuilder {
    HttpServer::builder().port(0).log_level(LogLevel::None)
}

async fn start(server: HttpServer) -> (HttpServer, SocketAddr) {
    let _ = pretty_env_logger::try_init();
    server.implement_api("Test", |call: ApiCall| async move {
        let name = call.req()["name"].as_str().unwrap_or("").to_owned();
        call.succ(json!({ "reply": format!("Test reply: {}", name) }))
            .await;
        Ok(())
    });
    let addr = server.start().await.unwrap();
    (server, addr)
}

async fn serve() -> (HttpServer, SocketAddr) {
    start(server_builder().build(&proto()).unwrap()).await
}

fn client_builder(addr: SocketAddr) -> tsrpc::HttpClientBuilder {
    HttpClient::builder()
        .server(format!("http://127.0.0.1:{}", addr.port()))
        .log_level(LogLevel::None)
}

fn client(addr: SocketAddr) -> HttpClient {
    client_builder(addr).build(&proto()).unwrap()
}

fn expect_succ(ret: Option<ApiReturn>) -> serde_json::Value {
    match ret.expect("flow aborted unexpectedly") {
        ApiReturn::Succ(res) => res,
        ApiReturn::Err(err) => panic!("unexpected error: {}", err),
    }
}

fn expect_err(ret: Option<ApiReturn>) -> TsrpcError {
    match ret.expect("flow aborted unexpectedly") {
        ApiReturn::Succ(res) => panic!("unexpected success: {}", res),
        ApiReturn::Err(err) => err,
    }
}

#[tokio::test]
async fn happy_path_text() {
    let (server, addr) = serve().await;
    let client = client(addr);

    let ret = client.call_api("Test", json!({"name": "Req1"})).await;
    assert_eq!(expect_succ(ret), json!({"reply": "Test reply: Req1"}));

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn nested_path() {
    let (server, addr) = serve().await;
    server.implement_api("a/b/c/Test", |call: ApiCall| async move {
        let name = call.req()["name"].as_str().unwrap_or("").to_owned();
        call.succ(json!({ "reply": format!("a/b/c/Test reply: {}", name) }))
            .await;
        Ok(())
    });
    let client = client(addr);

    let ret = client.call_api("a/b/c/Test", json!({"name": "Req2"})).await;
    assert_eq!(expect_succ(ret), json!({"reply": "a/b/c/Test reply: Req2"}));

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn handler_error_wrapped_with_inner() {
    let server = server_builder()
        .return_inner_error(true)
        .build(&proto())
        .unwrap();
    let (server, addr) = start(server).await;
    server.implement_api("Slow", |_call: ApiCall| async move {
        Err("Test InnerError".into())
    });
    let client = client(addr);

    let err = expect_err(client.call_api("Slow", json!({"name": "x"})).await);
    assert_eq!(err.message, "Internal Server Error");
    assert_eq!(err.code.as_deref(), Some("INTERNAL_ERR"));
    assert_eq!(err.kind, ErrorType::ServerError);
    assert_eq!(err.inner_err, Some(json!("Test InnerError")));

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn handler_error_sanitized_without_inner() {
    let server = server_builder()
        .return_inner_error(false)
        .build(&proto())
        .unwrap();
    let (server, addr) = start(server).await;
    server.implement_api("Slow", |_call: ApiCall| async move {
        Err("secret detail".into())
    });
    let client = client(addr);

    let err = expect_err(client.call_api("Slow", json!({"name": "x"})).await);
    assert_eq!(err.code.as_deref(), Some("INTERNAL_ERR"));
    assert_eq!(err.inner_err, None);

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn api_error_reaches_caller_verbatim() {
    let (server, addr) = serve().await;
    server.implement_api("Slow", |call: ApiCall| async move {
        call.error(
            TsrpcError::api("Test TsrpcError")
                .with_code("CODE_TEST")
                .with_info(json!("ErrInfo Test")),
        )
        .await;
        Ok(())
    });
    let client = client(addr);

    let err = expect_err(client.call_api("Slow", json!({"name": "x"})).await);
    assert_eq!(err.message, "Test TsrpcError");
    assert_eq!(err.code.as_deref(), Some("CODE_TEST"));
    assert_eq!(err.kind, ErrorType::ApiError);
    assert_eq!(err.info, Some(json!("ErrInfo Test")));

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn aborted_call_never_resolves() {
    let (server, addr) = serve().await;
    server.implement_api("Slow", |call: ApiCall| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        call.succ(json!({ "reply": "late" })).await;
        Ok(())
    });
    let client = client(addr);

    let worker = client.clone();
    let call = tokio::spawn(async move { worker.call_api("Slow", json!({"name": "x"})).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let sn = client.last_sn();
    assert!(sn > 0);
    client.abort(sn);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!call.is_finished(), "aborted call must stay unresolved");
    assert_eq!(client.pending_calls(), 0);
    call.abort();

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn server_timeout() {
    let server = server_builder()
        .api_call_timeout(Some(Duration::from_millis(100)))
        .build(&proto())
        .unwrap();
    let (server, addr) = start(server).await;
    server.implement_api("Slow", |call: ApiCall| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        call.succ(json!({ "reply": "too late" })).await;
        Ok(())
    });
    let client = client(addr);

    let err = expect_err(client.call_api("Slow", json!({"name": "x"})).await);
    assert_eq!(err.message, "Server Timeout");
    assert_eq!(err.code.as_deref(), Some("SERVER_TIMEOUT"));
    assert_eq!(err.kind, ErrorType::ServerError);

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn connection_refused() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client(addr);
    let err = expect_err(client.call_api("Test", json!({"name": "x"})).await);
    assert_eq!(err.code.as_deref(), Some("ECONNREFUSED"));
    assert_eq!(err.kind, ErrorType::NetworkError);
}

#[tokio::test]
async fn call_timeout_on_silent_server() {
    let (server, addr) = serve().await;
    server.implement_api("Slow", |call: ApiCall| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        call.succ(json!({ "reply": "late" })).await;
        Ok(())
    });
    let client = client(addr);

    let err = expect_err(
        client
            .call_api_with(
                "Slow",
                json!({"name": "x"}),
                CallApiOptions {
                    timeout: Some(Duration::from_millis(50)),
                },
            )
            .await,
    );
    assert_eq!(err.message, "Request Timeout");
    assert_eq!(err.code.as_deref(), Some("TIMEOUT"));
    assert_eq!(err.kind, ErrorType::NetworkError);

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn sns_increase_per_call() {
    let (server, addr) = serve().await;
    let client = client(addr);

    assert_eq!(client.last_sn(), 0);
    for expected in 1..=5u32 {
        let ret = client.call_api("Test", json!({"name": "x"})).await;
        assert!(expect_succ(ret).is_object());
        assert_eq!(client.last_sn(), expected);
    }

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn pending_registry_drains_after_batch() {
    let (server, addr) = serve().await;
    let client = client(addr);

    let calls: Vec<_> = (0..8)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call_api("Test", json!({ "name": format!("n{}", i) }))
                    .await
            })
        })
        .collect();
    for call in calls {
        let ret = call.await.unwrap();
        assert!(expect_succ(ret).is_object());
    }
    assert_eq!(client.pending_calls(), 0);

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn flow_abort_prevents_send_and_handler() {
    let handled = Arc::new(AtomicUsize::new(0));
    let (server, addr) = serve().await;
    let handled2 = handled.clone();
    server.implement_api("Slow", move |call: ApiCall| {
        let handled = handled2.clone();
        async move {
            handled.fetch_add(1, Ordering::SeqCst);
            call.succ(json!({"reply": "ran"})).await;
            Ok(())
        }
    });
    let client = client(addr);
    client.flows().pre_call_api.push(|_| FlowControl::Abort);

    let ret = client.call_api("Slow", json!({"name": "x"})).await;
    assert!(ret.is_none());
    assert_eq!(client.pending_calls(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 0);

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn pre_call_api_can_rewrite_request() {
    let (server, addr) = serve().await;
    let client = client(addr);
    client.flows().pre_call_api.push(|mut flow| {
        flow.req["name"] = json!("Rewritten");
        FlowControl::Continue(flow)
    });

    let ret = client.call_api("Test", json!({"name": "Original"})).await;
    assert_eq!(expect_succ(ret), json!({"reply": "Test reply: Rewritten"}));

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn pre_call_api_return_can_rewrite_return() {
    let (server, addr) = serve().await;
    let client = client(addr);
    client.flows().pre_call_api_return.push(|mut flow| {
        flow.ret = ApiReturn::Succ(json!({"reply": "patched"}));
        FlowControl::Continue(flow)
    });

    let ret = client.call_api("Test", json!({"name": "x"})).await;
    assert_eq!(expect_succ(ret), json!({"reply": "patched"}));

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn binary_mode_end_to_end() {
    let (server, addr) = serve().await;
    let client = client_builder(addr)
        .data_type(DataType::Buffer)
        .build(&proto())
        .unwrap();

    let ret = client.call_api("Test", json!({"name": "Req1"})).await;
    assert_eq!(expect_succ(ret), json!({"reply": "Test reply: Req1"}));

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn binary_mode_carries_api_errors() {
    let (server, addr) = serve().await;
    server.implement_api("Slow", |call: ApiCall| async move {
        call.error(TsrpcError::api("nope").with_code("CODE_TEST")).await;
        Ok(())
    });
    let client = client_builder(addr)
        .data_type(DataType::Buffer)
        .build(&proto())
        .unwrap();

    let err = expect_err(client.call_api("Slow", json!({"name": "x"})).await);
    assert_eq!(err.message, "nope");
    assert_eq!(err.kind, ErrorType::ApiError);

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn send_msg_reaches_server_listeners() {
    let (server, addr) = serve().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    server.on_msg("Chat", move |call| {
        tx.send((call.msg_name.clone(), call.msg)).ok();
    });
    let client = client(addr);

    let sent = client.send_msg("Chat", json!({"content": "hello"})).await;
    sent.expect("flow aborted").unwrap();

    let (name, msg) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name, "Chat");
    assert_eq!(msg, json!({"content": "hello"}));

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn send_msg_binary_mode() {
    let (server, addr) = serve().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    server.on_msg("Chat", move |call| {
        tx.send(call.msg).ok();
    });
    let client = client_builder(addr)
        .data_type(DataType::Buffer)
        .build(&proto())
        .unwrap();

    client
        .send_msg("Chat", json!({"content": "binary hello"}))
        .await
        .expect("flow aborted")
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg, json!({"content": "binary hello"}));

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn once_listener_fires_for_single_message() {
    let (server, addr) = serve().await;
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    server.once_msg("Chat", move |_| {
        count2.fetch_add(1, Ordering::SeqCst);
    });
    let client = client(addr);

    for _ in 0..2 {
        client
            .send_msg("Chat", json!({"content": "x"}))
            .await
            .expect("flow aborted")
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn unknown_msg_name_is_local_error() {
    let (server, addr) = serve().await;
    let client = client(addr);

    let sent = client.send_msg("NoSuchMsg", json!({})).await;
    let err = sent.expect("flow aborted").unwrap_err();
    assert_eq!(err.kind, ErrorType::LocalError);
    assert_eq!(err.message, "Invalid service name");

    server.stop(None).await.unwrap();
}
