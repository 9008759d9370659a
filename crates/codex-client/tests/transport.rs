use codex_client::{
    AppServerClient, AppServerError, AppServerInbound, AppServerRequestId, ClientInfo,
    ThreadStartParams,
};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn client_info() -> ClientInfo {
    ClientInfo {
        name: "codex-sync-test".to_string(),
        title: None,
        version: "0.1.0".to_string(),
    }
}

async fn read_frame<R>(reader: &mut BufReader<R>) -> anyhow::Result<Value>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Err(anyhow::anyhow!("client closed the stream"));
    }
    Ok(serde_json::from_str(line.trim())?)
}

async fn write_frame<W>(writer: &mut W, value: &Value) -> anyhow::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let line = format!("{}\n", serde_json::to_string(value)?);
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[tokio::test]
async fn initialize_then_thread_start_round_trip() -> anyhow::Result<()> {
    let (client_stream, server_stream) = tokio::io::duplex(16 * 1024);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, mut server_write) = tokio::io::split(server_stream);

    let (client, _inbound) =
        AppServerClient::connect_with_io(Box::new(client_write), Box::new(client_read), None);

    let server = tokio::spawn(async move {
        let mut reader = BufReader::new(server_read);

        let initialize = read_frame(&mut reader).await?;
        assert_eq!(initialize["method"], "initialize");
        assert_eq!(initialize["params"]["clientInfo"]["name"], "codex-sync-test");
        write_frame(
            &mut server_write,
            &json!({"id": initialize["id"].clone(), "result": {"userAgent": "codex/1.0"}}),
        )
        .await?;

        let initialized = read_frame(&mut reader).await?;
        assert_eq!(initialized["method"], "initialized");
        assert!(initialized.get("id").is_none());

        let start = read_frame(&mut reader).await?;
        assert_eq!(start["method"], "thread/start");
        assert_eq!(start["params"], json!({"cwd": "/repo"}));
        write_frame(
            &mut server_write,
            &json!({
                "id": start["id"].clone(),
                "result": {"thread": {"id": "thr_1"}, "model": "gpt-5.2-codex"}
            }),
        )
        .await?;

        Ok::<(), anyhow::Error>(())
    });

    let init = client.initialize(client_info()).await?;
    assert_eq!(init.user_agent, "codex/1.0");

    let response = client
        .thread_start(ThreadStartParams {
            cwd: Some("/repo".to_string()),
            ..Default::default()
        })
        .await?;
    assert_eq!(response.thread.id, "thr_1");
    assert_eq!(response.model, "gpt-5.2-codex");

    server.await??;
    Ok(())
}

#[tokio::test]
async fn already_initialized_is_not_an_error() -> anyhow::Result<()> {
    let (client_stream, server_stream) = tokio::io::duplex(16 * 1024);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, mut server_write) = tokio::io::split(server_stream);

    let (client, _inbound) =
        AppServerClient::connect_with_io(Box::new(client_write), Box::new(client_read), None);

    let server = tokio::spawn(async move {
        let mut reader = BufReader::new(server_read);
        let initialize = read_frame(&mut reader).await?;
        write_frame(
            &mut server_write,
            &json!({
                "id": initialize["id"].clone(),
                "error": {"code": -32600, "message": "Already initialized"}
            }),
        )
        .await?;
        let initialized = read_frame(&mut reader).await?;
        assert_eq!(initialized["method"], "initialized");
        Ok::<(), anyhow::Error>(())
    });

    let init = client.initialize(client_info()).await?;
    assert_eq!(init.user_agent, "");
    server.await??;
    Ok(())
}

#[tokio::test]
async fn error_responses_carry_code_and_message() -> anyhow::Result<()> {
    let (client_stream, server_stream) = tokio::io::duplex(16 * 1024);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, mut server_write) = tokio::io::split(server_stream);

    let (client, _inbound) =
        AppServerClient::connect_with_io(Box::new(client_write), Box::new(client_read), None);

    let server = tokio::spawn(async move {
        let mut reader = BufReader::new(server_read);
        let start = read_frame(&mut reader).await?;
        write_frame(
            &mut server_write,
            &json!({
                "id": start["id"].clone(),
                "error": {"code": -32000, "message": "thread not found"}
            }),
        )
        .await?;
        Ok::<(), anyhow::Error>(())
    });

    let result = client.thread_start(ThreadStartParams::default()).await;
    let err = match result {
        Ok(_) => return Err(anyhow::anyhow!("expected an error response")),
        Err(err) => err,
    };
    let rpc = err
        .downcast_ref::<AppServerError>()
        .ok_or_else(|| anyhow::anyhow!("expected AppServerError, got {err}"))?;
    assert_eq!(rpc.code, -32000);
    assert_eq!(rpc.message, "thread not found");

    server.await??;
    Ok(())
}

#[tokio::test]
async fn notifications_and_server_requests_arrive_in_wire_order() -> anyhow::Result<()> {
    let (client_stream, server_stream) = tokio::io::duplex(16 * 1024);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, mut server_write) = tokio::io::split(server_stream);

    let (client, mut inbound) =
        AppServerClient::connect_with_io(Box::new(client_write), Box::new(client_read), None);

    write_frame(
        &mut server_write,
        &json!({"method": "turn/started", "params": {"threadId": "thr_1"}}),
    )
    .await?;
    write_frame(
        &mut server_write,
        &json!({
            "id": "req-7",
            "method": "item/commandExecution/requestApproval",
            "params": {"threadId": "thr_1", "itemId": "item-1"}
        }),
    )
    .await?;
    write_frame(&mut server_write, &json!({"method": "turn/completed"})).await?;

    let mut methods = Vec::new();
    let mut request_id = None;
    for _ in 0..3 {
        let next = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("inbound closed early"))?;
        match next {
            AppServerInbound::Notification(notification) => methods.push(notification.method),
            AppServerInbound::Request(request) => {
                methods.push(request.method);
                request_id = Some(request.id);
            }
        }
    }
    assert_eq!(
        methods,
        vec![
            "turn/started".to_string(),
            "item/commandExecution/requestApproval".to_string(),
            "turn/completed".to_string(),
        ]
    );
    let request_id = request_id.ok_or_else(|| anyhow::anyhow!("missing server request"))?;
    assert_eq!(request_id, AppServerRequestId::String("req-7".to_string()));

    client
        .respond(&request_id, &json!({"decision": "accept"}))
        .await?;
    let mut reader = BufReader::new(server_read);
    let reply = read_frame(&mut reader).await?;
    assert_eq!(reply, json!({"id": "req-7", "result": {"decision": "accept"}}));

    Ok(())
}

#[tokio::test]
async fn closed_stream_fails_pending_requests_and_ends_inbound() -> anyhow::Result<()> {
    let (client_stream, server_stream) = tokio::io::duplex(16 * 1024);
    let (client_read, client_write) = tokio::io::split(client_stream);

    let (client, mut inbound) =
        AppServerClient::connect_with_io(Box::new(client_write), Box::new(client_read), None);

    let server = tokio::spawn(async move {
        let (server_read, _server_write) = tokio::io::split(server_stream);
        let mut reader = BufReader::new(server_read);
        let _request = read_frame(&mut reader).await?;
        Ok::<(), anyhow::Error>(())
    });

    let result = client.thread_start(ThreadStartParams::default()).await;
    assert!(result.is_err());
    server.await??;

    let ended = tokio::time::timeout(Duration::from_secs(2), inbound.recv()).await?;
    assert!(ended.is_none());

    let after_close = client.thread_start(ThreadStartParams::default()).await;
    assert!(after_close.is_err());
    Ok(())
}
