//! Bridge Manager lifecycle with real child processes

#[cfg(all(test, unix))]
mod tests {
    use easy_bridge::{
        watch_bridge_config, Bridge, BridgeEvent, BridgeManager, BridgeSettings, BridgeState,
        BridgeTimeouts,
    };
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    fn write_config(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("mcp-bridge.json");
        std::fs::write(&path, content).unwrap();
        path
    }

    fn manager(path: PathBuf) -> Arc<BridgeManager> {
        Arc::new(BridgeManager::new(BridgeSettings {
            config_path: Some(path),
            timeouts: BridgeTimeouts {
                initialize: Duration::from_secs(30),
                call: Duration::from_secs(10),
            },
            grace: Duration::from_millis(100),
        }))
    }

    #[tokio::test]
    async fn test_restart_rejects_all_in_flight_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{"mcpServers": {"sleeper": {"command": "sleep", "args": ["30"]}}}"#,
        );
        let manager = manager(path);
        let mut events = manager.subscribe();

        let bridges = manager.live_bridges().await;
        assert_eq!(bridges.len(), 1);
        let original = bridges[0].clone();

        // `sleep` never answers initialize, so every call stays in flight
        let calls: Vec<_> = (0..5)
            .map(|_| {
                let bridge = original.clone();
                tokio::spawn(async move {
                    bridge.call("tools/list", None, Duration::from_secs(10)).await
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(manager.restart_bridges().await, 1);

        for call in calls {
            let err = tokio::time::timeout(Duration::from_secs(5), call)
                .await
                .expect("call still pending after restart")
                .unwrap()
                .unwrap_err();
            assert!(err.to_string().contains("stopped"), "{}", err);
        }
        assert_eq!(original.state(), BridgeState::Stopped);

        let current = manager.live_bridges().await;
        assert_eq!(current.len(), 1);
        assert!(!Arc::ptr_eq(&current[0], &original));

        match events.recv().await.unwrap() {
            BridgeEvent::Restarted { count } => assert_eq!(count, 1),
            other => panic!("unexpected event: {:?}", other),
        }
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_bridge_that_exits_immediately_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{"mcpServers": {
                "echo": {"command": "echo", "args": ["{}"]},
                "sleeper": {"command": "sleep", "args": ["30"]}
            }}"#,
        );
        let manager = manager(path);

        let live = manager.live_bridges().await;
        let names: Vec<&str> = live.iter().map(|b| b.name()).collect();
        assert_eq!(names, vec!["sleeper"]);
        assert!(manager.get("echo").await.is_none());
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_bridge_notifications_are_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{"mcpServers": {"chatty": {"command": "sh", "args": ["-c",
                "sleep 0.2; echo '{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{\"level\":\"info\"}}'; sleep 30"
            ]}}}"#,
        );
        let manager = manager(path);
        let mut events = manager.subscribe();
        assert_eq!(manager.ensure_bridges().await.len(), 1);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            BridgeEvent::Notification { bridge, message } => {
                assert_eq!(bridge, "chatty");
                assert_eq!(message["method"], "notifications/message");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_config_change_triggers_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), r#"{"mcpServers": {}}"#);
        let manager = manager(path.clone());
        assert!(manager.ensure_bridges().await.is_empty());

        let mut events = manager.subscribe();
        let _watcher = watch_bridge_config(manager.clone(), path.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        std::fs::write(&path, r#"{"mcpServers": {"sleeper": {"command": "sleep", "args": ["30"]}}}"#)
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, BridgeEvent::Restarted { count: 1 }), "{:?}", event);
        manager.stop_all().await;
    }
}
