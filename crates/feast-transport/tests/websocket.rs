//! Integration tests for the WebSocket transport.
//!
//! These spin up a real listener on an OS-assigned port and talk to it
//! with a `tokio-tungstenite` client.

#[cfg(feature = "websocket")]
mod websocket {
    use futures_util::{SinkExt, StreamExt};
    use feast_transport::{
        Connection, OriginPolicy, Transport, TransportError, WebSocketTransport,
    };
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::header::ORIGIN;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message;

    type ClientWs = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn connect_client(url: &str) -> ClientWs {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("client should connect");
        ws
    }

    async fn connect_from(
        url: &str,
        origin: &'static str,
    ) -> Result<ClientWs, tokio_tungstenite::tungstenite::Error> {
        let mut request = url.into_client_request().expect("valid request");
        request
            .headers_mut()
            .insert(ORIGIN, HeaderValue::from_static(origin));
        tokio_tungstenite::connect_async(request).await.map(|(ws, _)| ws)
    }

    async fn bind() -> (WebSocketTransport, String) {
        let transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("bound address");
        (transport, addr.to_string())
    }

    #[tokio::test]
    async fn test_websocket_text_round_trip_between_peers() {
        let (mut transport, addr) = bind().await;
        let server =
            tokio::spawn(async move { transport.accept().await.expect("accept") });

        let mut client = connect_client(&format!("ws://{addr}/ws")).await;
        let conn = server.await.expect("task should complete");
        assert!(conn.id().into_inner() > 0);

        conn.send(br#"{"type":"queue_joined"}"#).await.expect("send");
        let msg = client.next().await.unwrap().unwrap();
        assert!(msg.is_text(), "server frames are text");
        assert_eq!(msg.into_text().unwrap().as_str(), r#"{"type":"queue_joined"}"#);

        client
            .send(Message::Text(r#"{"type":"leave_room"}"#.into()))
            .await
            .unwrap();
        let received = conn.recv().await.expect("recv").expect("data");
        assert_eq!(received, br#"{"type":"leave_room"}"#);

        conn.close().await.expect("close should succeed");
    }

    #[tokio::test]
    async fn test_websocket_accept_captures_session_query() {
        let (mut transport, addr) = bind().await;
        let server =
            tokio::spawn(async move { transport.accept().await.expect("accept") });

        let _client =
            connect_client(&format!("ws://{addr}/ws?sessionId=abc_123&v=2")).await;
        let conn = server.await.unwrap();

        assert_eq!(conn.query_param("sessionId"), Some("abc_123"));
        assert_eq!(conn.query_param("v"), Some("2"));
        assert_eq!(conn.query_param("missing"), None);
    }

    #[tokio::test]
    async fn test_websocket_recv_returns_none_on_client_close() {
        let (mut transport, addr) = bind().await;
        let server =
            tokio::spawn(async move { transport.accept().await.expect("accept") });

        let mut client = connect_client(&format!("ws://{addr}")).await;
        let conn = server.await.unwrap();

        client.send(Message::Close(None)).await.unwrap();

        let result = conn.recv().await.expect("recv should not error");
        assert!(result.is_none(), "should return None on client close");
    }

    #[tokio::test]
    async fn test_websocket_pong_counts_as_activity() {
        let (mut transport, addr) = bind().await;
        let server =
            tokio::spawn(async move { transport.accept().await.expect("accept") });

        let mut client = connect_client(&format!("ws://{addr}")).await;
        let conn = server.await.unwrap();

        conn.ping().await.expect("ping");
        // Reading on the client side answers the ping automatically.
        let frame = client.next().await.unwrap().unwrap();
        assert!(frame.is_ping());
        client.send(Message::Text("after-ping".into())).await.unwrap();

        let data = conn.recv().await.unwrap().unwrap();
        assert_eq!(data, b"after-ping");
        assert!(conn.idle_for() < std::time::Duration::from_secs(5));
    }

    // =====================================================================
    // Origin policy
    // =====================================================================

    #[tokio::test]
    async fn test_default_policy_accepts_localhost_origin() {
        let (mut transport, addr) = bind().await;
        let server = tokio::spawn(async move { transport.accept().await });

        let client = connect_from(&format!("ws://{addr}/ws"), "http://localhost:3000").await;
        assert!(client.is_ok(), "localhost page should upgrade");
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_default_policy_rejects_foreign_origin() {
        let (mut transport, addr) = bind().await;
        let server = tokio::spawn(async move { transport.accept().await });

        let client = connect_from(&format!("ws://{addr}/ws"), "https://evil.example").await;
        assert!(client.is_err(), "foreign page should be refused");
        match server.await.unwrap() {
            Err(TransportError::OriginRejected(origin)) => {
                assert_eq!(origin, "https://evil.example");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("upgrade should have been refused"),
        }
    }

    #[tokio::test]
    async fn test_allow_list_matches_origin_case_insensitively() {
        let (transport, addr) = bind().await;
        let mut transport =
            transport.with_origin_policy(OriginPolicy::from_list("https://app.example.com"));
        let server = tokio::spawn(async move {
            let first = transport.accept().await;
            let second = transport.accept().await;
            (first, second)
        });

        let url = format!("ws://{addr}/ws");
        let upper = connect_from(&url, "HTTPS://APP.EXAMPLE.COM").await;
        assert!(upper.is_ok());
        let local = connect_from(&url, "http://localhost:3000").await;
        assert!(local.is_err(), "an explicit list replaces the localhost default");

        let (first, second) = server.await.unwrap();
        assert!(first.is_ok());
        assert!(matches!(second, Err(TransportError::OriginRejected(_))));
    }

    #[tokio::test]
    async fn test_upgrade_without_origin_header_is_accepted() {
        let (transport, addr) = bind().await;
        let mut transport =
            transport.with_origin_policy(OriginPolicy::from_list("https://app.example.com"));
        let server = tokio::spawn(async move { transport.accept().await.expect("accept") });

        let _client = connect_client(&format!("ws://{addr}/ws")).await;
        let conn = server.await.unwrap();
        assert!(conn.id().into_inner() > 0);
    }
}
