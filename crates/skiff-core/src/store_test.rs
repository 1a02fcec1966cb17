#[cfg(test)]
mod tests {
    use crate::history::{CommandHistory, HISTORY_LIMIT};
    use crate::models::{ActionClass, AuthMethod, Server};
    use crate::pending::{META_COMMAND_MUTEX, PendingTracker};
    use crate::secrets::SecretStore;
    use crate::store::ServerStore;
    use uuid::Uuid;

    fn test_server() -> Server {
        Server {
            id: Uuid::new_v4(),
            name: "web01".into(),
            hostname: "web01.example.com".into(),
            port: 22,
            username: "root".into(),
            auth: AuthMethod::Agent,
            provider: "digitalocean".into(),
            size: "s-1vcpu-1gb".into(),
            web_server: "nginx".into(),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn server_crud() {
        let store = ServerStore::new_test();
        let server = test_server();
        store.upsert_server(&server).unwrap();

        let fetched = store.get_server(&server.id).unwrap().unwrap();
        assert_eq!(fetched.hostname, "web01.example.com");

        let all = store.list_servers().unwrap();
        assert!(all.iter().any(|s| s.id == server.id));

        store.remove_server(&server.id).unwrap();
        assert!(store.get_server(&server.id).unwrap().is_none());
    }

    #[test]
    fn removing_a_server_drops_its_metadata() {
        let store = ServerStore::new_test();
        let server = test_server();
        store.upsert_server(&server).unwrap();
        store.set_meta(&server.id, "stats_data", "load 0.1").unwrap();

        store.remove_server(&server.id).unwrap();
        assert!(store.get_meta(&server.id, "stats_data").unwrap().is_none());
    }

    #[test]
    fn meta_set_get_delete() {
        let store = ServerStore::new_test();
        let id = Uuid::new_v4();

        assert!(store.get_meta(&id, "action").unwrap().is_none());
        store.set_meta(&id, "action", "git_install").unwrap();
        assert_eq!(
            store.get_meta(&id, "action").unwrap().as_deref(),
            Some("git_install")
        );
        store.delete_meta(&id, "action").unwrap();
        assert!(store.get_meta(&id, "action").unwrap().is_none());
    }

    #[test]
    fn pending_marker_lifecycle() {
        let store = ServerStore::new_test();
        let tracker = PendingTracker::new(&store);
        let id = Uuid::new_v4();

        assert!(!tracker.is_pending(&id, ActionClass::Git).unwrap());
        tracker.mark_pending(&id, ActionClass::Git).unwrap();
        assert!(tracker.is_pending(&id, ActionClass::Git).unwrap());
        // Other classes are unaffected.
        assert!(!tracker.is_pending(&id, ActionClass::Firewall).unwrap());

        tracker.clear_pending(&id, ActionClass::Git).unwrap();
        assert!(!tracker.is_pending(&id, ActionClass::Git).unwrap());
        // Second clear is a no-op.
        tracker.clear_pending(&id, ActionClass::Git).unwrap();
        assert!(!tracker.is_pending(&id, ActionClass::Git).unwrap());
    }

    #[test]
    fn mark_pending_is_idempotent() {
        let store = ServerStore::new_test();
        let tracker = PendingTracker::new(&store);
        let id = Uuid::new_v4();

        tracker.mark_pending(&id, ActionClass::Users).unwrap();
        tracker.mark_pending(&id, ActionClass::Users).unwrap();
        tracker.clear_pending(&id, ActionClass::Users).unwrap();
        assert!(!tracker.is_pending(&id, ActionClass::Users).unwrap());
    }

    #[test]
    fn cleanup_clears_every_marker_and_context() {
        let store = ServerStore::new_test();
        let tracker = PendingTracker::new(&store);
        let id = Uuid::new_v4();

        tracker.mark_pending(&id, ActionClass::Git).unwrap();
        tracker.mark_pending(&id, ActionClass::Resize).unwrap();
        tracker.record_context(&id, "git_install", "{}").unwrap();

        tracker.clear_all(&id).unwrap();
        assert!(!tracker.is_pending(&id, ActionClass::Git).unwrap());
        assert!(!tracker.is_pending(&id, ActionClass::Resize).unwrap());
        assert!(store.get_meta(&id, META_COMMAND_MUTEX).unwrap().is_none());
        assert!(store.get_meta(&id, "action").unwrap().is_none());
        assert!(store.get_meta(&id, "action_args").unwrap().is_none());
        assert!(store.get_meta(&id, "action_status").unwrap().is_none());
    }

    #[test]
    fn history_dedupes_and_promotes() {
        let store = ServerStore::new_test();
        let secrets = SecretStore::with_passphrase("test-key");
        let history = CommandHistory::new(&store, &secrets);
        let id = Uuid::new_v4();

        history.record(&id, "uptime").unwrap();
        history.record(&id, "df -h").unwrap();
        history.record(&id, "uptime").unwrap();

        let entries = history.list(&id).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].command, "uptime");
        assert_eq!(entries[1].command, "df -h");
    }

    #[test]
    fn history_text_is_encrypted_at_rest() {
        let store = ServerStore::new_test();
        let secrets = SecretStore::with_passphrase("test-key");
        let history = CommandHistory::new(&store, &secrets);
        let id = Uuid::new_v4();

        history.record(&id, "cat /etc/passwd").unwrap();
        let raw = store.get_meta(&id, "console_history").unwrap().unwrap();
        assert!(!raw.contains("cat /etc/passwd"));
    }

    #[test]
    fn history_remove_missing_key_is_noop() {
        let store = ServerStore::new_test();
        let secrets = SecretStore::with_passphrase("test-key");
        let history = CommandHistory::new(&store, &secrets);
        let id = Uuid::new_v4();

        history.record(&id, "uptime").unwrap();
        history.remove(&id, "no-such-key").unwrap();
        assert_eq!(history.list(&id).unwrap().len(), 1);

        let key = CommandHistory::content_key("uptime");
        history.remove(&id, &key).unwrap();
        assert!(history.list(&id).unwrap().is_empty());
        // Removing again stays a no-op.
        history.remove(&id, &key).unwrap();
    }

    #[test]
    fn history_is_bounded() {
        let store = ServerStore::new_test();
        let secrets = SecretStore::with_passphrase("test-key");
        let history = CommandHistory::new(&store, &secrets);
        let id = Uuid::new_v4();

        for i in 0..HISTORY_LIMIT + 10 {
            history.record(&id, &format!("echo {i}")).unwrap();
        }
        let entries = history.list(&id).unwrap();
        assert_eq!(entries.len(), HISTORY_LIMIT);
        // Most recent survives, oldest fell off.
        assert_eq!(entries[0].command, format!("echo {}", HISTORY_LIMIT + 9));
        assert!(!entries.iter().any(|e| e.command == "echo 0"));
    }

    #[test]
    fn history_clear() {
        let store = ServerStore::new_test();
        let secrets = SecretStore::with_passphrase("test-key");
        let history = CommandHistory::new(&store, &secrets);
        let id = Uuid::new_v4();

        history.record(&id, "uptime").unwrap();
        history.record(&id, "free -m").unwrap();
        history.clear(&id).unwrap();
        assert!(history.list(&id).unwrap().is_empty());
    }
}
