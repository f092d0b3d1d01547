#[cfg(test)]
mod tests {
    use crate::{Redirector, RedirectorService, RootConfig, RootTable};
    use redir_lib::{
        AccessMode, ClientId, CreateParams, EntryKind, GuestPath, OpenDisposition, RedirError,
        RootId,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    fn client() -> ClientId {
        ClientId("guest-1".to_string())
    }

    fn wire(path: &str) -> Vec<u8> {
        GuestPath::new(path).unwrap().to_wire()
    }

    fn file_rw() -> CreateParams {
        CreateParams {
            disposition: OpenDisposition::OpenOrCreate,
            access: AccessMode::ReadWrite,
            directory: false,
        }
    }

    fn file_ro() -> CreateParams {
        CreateParams {
            disposition: OpenDisposition::OpenExisting,
            access: AccessMode::Read,
            directory: false,
        }
    }

    fn dir_open() -> CreateParams {
        CreateParams {
            disposition: OpenDisposition::OpenExisting,
            access: AccessMode::Read,
            directory: true,
        }
    }

    async fn share_root(svc: &RedirectorService, tmp: &TempDir, case_sensitive: bool) -> RootId {
        svc.roots()
            .share(RootConfig {
                name: "share".to_string(),
                base_path: tmp.path().to_path_buf(),
                case_sensitive,
                read_only: false,
            })
            .await
            .unwrap()
    }

    async fn create_service() -> (RedirectorService, RootId, TempDir) {
        let tmp = TempDir::new().unwrap();
        let svc = RedirectorService::new(Arc::new(RootTable::new()));
        let root_id = share_root(&svc, &tmp, true).await;
        svc.client_connected(&client()).await.unwrap();
        (svc, root_id, tmp)
    }

    // ==================== Path Translation Tests ====================

    #[tokio::test]
    async fn test_parent_traversal_is_rejected() {
        let (svc, root, _tmp) = create_service().await;
        for path in ["..", "../escape", "a/../../etc/passwd", "..\\windows"] {
            let err = svc
                .create(&client(), root, &wire(path), &file_rw())
                .await
                .unwrap_err();
            assert!(
                matches!(err, RedirError::InvalidPath(_)),
                "path {:?} gave {:?}",
                path,
                err
            );
        }
    }

    #[tokio::test]
    async fn test_valid_paths_stay_under_base() {
        let (svc, root, tmp) = create_service().await;
        std::fs::create_dir(tmp.path().join("sub")).unwrap();

        let (handle, _) = svc
            .create(&client(), root, &wire("sub/notes.txt"), &file_rw())
            .await
            .unwrap();
        svc.close(&client(), handle).await.unwrap();
        assert!(tmp.path().join("sub/notes.txt").exists());
    }

    #[tokio::test]
    async fn test_malformed_wire_path() {
        let (svc, root, _tmp) = create_service().await;
        // Length prefix claims more bytes than follow.
        let err = svc
            .create(&client(), root, &[10, 0, b'a'], &file_rw())
            .await
            .unwrap_err();
        assert!(matches!(err, RedirError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_case_folding_on_insensitive_root() {
        let tmp = TempDir::new().unwrap();
        let svc = RedirectorService::new(Arc::new(RootTable::new()));
        let root = svc
            .roots()
            .share(RootConfig {
                name: "ci".to_string(),
                base_path: tmp.path().to_path_buf(),
                case_sensitive: false,
                read_only: false,
            })
            .await
            .unwrap();
        svc.client_connected(&client()).await.unwrap();

        std::fs::create_dir(tmp.path().join("Docs")).unwrap();
        std::fs::write(tmp.path().join("Docs/Readme.MD"), b"hi").unwrap();

        let (handle, info) = svc
            .create(&client(), root, &wire("docs/readme.md"), &file_ro())
            .await
            .unwrap();
        assert_eq!(info.size, 2);
        svc.close(&client(), handle).await.unwrap();
    }

    // ==================== Read/Write Tests ====================

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let (svc, root, _tmp) = create_service().await;
        let (handle, _) = svc
            .create(&client(), root, &wire("hello.txt"), &file_rw())
            .await
            .unwrap();

        let written = svc
            .write(&client(), handle, 0, b"hello")
            .await
            .unwrap();
        assert_eq!(written, 5);

        let data = svc.read(&client(), handle, 0, 5).await.unwrap();
        assert_eq!(data, b"hello");

        // Short read past end of file is success.
        let tail = svc.read(&client(), handle, 3, 64).await.unwrap();
        assert_eq!(tail, b"lo");
    }

    #[tokio::test]
    async fn test_paged_write_then_paged_read() {
        let (svc, root, _tmp) = create_service().await;
        let (handle, _) = svc
            .create(&client(), root, &wire("paged.bin"), &file_rw())
            .await
            .unwrap();

        let pages = vec![vec![b'a'; 8], vec![b'b'; 8], vec![b'c'; 4]];
        let outcome = svc.write_pages(&client(), handle, 0, 20, &pages).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.transferred, 20);

        let mut read_buf = vec![vec![0u8; 8], vec![0u8; 8], vec![0u8; 8]];
        let outcome = svc.read_pages(&client(), handle, 0, 24, &mut read_buf).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.transferred, 20);
        assert_eq!(read_buf[0], vec![b'a'; 8]);
        assert_eq!(read_buf[1], vec![b'b'; 8]);
        assert_eq!(read_buf[2], vec![b'c'; 4]);
    }

    #[tokio::test]
    async fn test_set_file_size_truncates_and_extends() {
        let (svc, root, _tmp) = create_service().await;
        let (handle, _) = svc
            .create(&client(), root, &wire("sized.bin"), &file_rw())
            .await
            .unwrap();
        svc.write(&client(), handle, 0, b"0123456789").await.unwrap();

        svc.set_file_size(&client(), handle, 4).await.unwrap();
        let info = svc.query_file_info(&client(), handle).await.unwrap();
        assert_eq!(info.size, 4);

        svc.set_file_size(&client(), handle, 100).await.unwrap();
        let info = svc.query_file_info(&client(), handle).await.unwrap();
        assert_eq!(info.size, 100);
    }

    // ==================== Handle Lifecycle Tests ====================

    #[tokio::test]
    async fn test_close_is_single_shot() {
        let (svc, root, _tmp) = create_service().await;
        let (handle, _) = svc
            .create(&client(), root, &wire("once.txt"), &file_rw())
            .await
            .unwrap();

        svc.close(&client(), handle).await.unwrap();
        let err = svc.close(&client(), handle).await.unwrap_err();
        assert!(matches!(err, RedirError::InvalidHandle(_)));
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_alias_reused_slot() {
        let (svc, root, _tmp) = create_service().await;
        let (old, _) = svc
            .create(&client(), root, &wire("first.txt"), &file_rw())
            .await
            .unwrap();
        svc.close(&client(), old).await.unwrap();

        let (new, _) = svc
            .create(&client(), root, &wire("second.txt"), &file_rw())
            .await
            .unwrap();
        // Same slot is reused with a new generation; the stale id stays dead.
        let err = svc.read(&client(), old, 0, 1).await.unwrap_err();
        assert!(matches!(err, RedirError::InvalidHandle(_)));
        svc.read(&client(), new, 0, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_closes_every_handle() {
        let (svc, root, _tmp) = create_service().await;
        let (h1, _) = svc
            .create(&client(), root, &wire("a.txt"), &file_rw())
            .await
            .unwrap();
        let (h2, _) = svc
            .create(&client(), root, &wire("b.txt"), &file_rw())
            .await
            .unwrap();

        svc.client_disconnected(&client()).await.unwrap();

        for handle in [h1, h2] {
            let err = svc.read(&client(), handle, 0, 1).await.unwrap_err();
            assert!(matches!(err, RedirError::InvalidHandle(_)));
        }

        // A reconnect starts from an empty table; old ids stay dead.
        svc.client_connected(&client()).await.unwrap();
        let err = svc.close(&client(), h1).await.unwrap_err();
        assert!(matches!(err, RedirError::InvalidHandle(_)));
    }

    #[tokio::test]
    async fn test_duplicate_connect_is_rejected() {
        let (svc, _root, _tmp) = create_service().await;
        let err = svc.client_connected(&client()).await.unwrap_err();
        assert!(matches!(err, RedirError::AlreadyExists(_)));
    }

    // ==================== Directory Listing Tests ====================

    #[tokio::test]
    async fn test_paged_listing_returns_every_entry() {
        let (svc, root, tmp) = create_service().await;
        for name in ["e1", "e2", "e3", "e4", "e5"] {
            std::fs::write(tmp.path().join(name), b"x").unwrap();
        }

        let (handle, _) = svc
            .create(&client(), root, &wire(""), &dir_open())
            .await
            .unwrap();

        let mut names = Vec::new();
        let mut calls = 0;
        loop {
            let (entries, more) = svc.list_dir(&client(), handle, 2, None).await.unwrap();
            calls += 1;
            names.extend(entries.into_iter().map(|e| e.name));
            if !more {
                break;
            }
        }
        assert_eq!(calls, 3);
        assert_eq!(names, vec!["e1", "e2", "e3", "e4", "e5"]);

        let (entries, more) = svc.list_dir(&client(), handle, 2, None).await.unwrap();
        assert!(entries.is_empty());
        assert!(!more);
    }

    #[tokio::test]
    async fn test_filtered_listing_and_rewind() {
        let (svc, root, tmp) = create_service().await;
        for name in ["a.txt", "b.log", "c.txt"] {
            std::fs::write(tmp.path().join(name), b"x").unwrap();
        }

        let (handle, _) = svc
            .create(&client(), root, &wire(""), &dir_open())
            .await
            .unwrap();
        let (entries, more) = svc
            .list_dir(&client(), handle, 0, Some("*.txt"))
            .await
            .unwrap();
        assert!(!more);
        let names: Vec<String> = entries.into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a.txt", "c.txt"]);

        svc.rewind_dir(&client(), handle).await.unwrap();
        let (entries, _) = svc.list_dir(&client(), handle, 0, None).await.unwrap();
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn test_listing_a_file_handle_fails() {
        let (svc, root, _tmp) = create_service().await;
        let (handle, _) = svc
            .create(&client(), root, &wire("plain.txt"), &file_rw())
            .await
            .unwrap();
        let err = svc.list_dir(&client(), handle, 0, None).await.unwrap_err();
        assert!(matches!(err, RedirError::InvalidHandle(_)));
    }

    // ==================== Lock Tests ====================

    #[tokio::test]
    async fn test_exclusive_lock_conflict_on_same_file() {
        let (svc, root, _tmp) = create_service().await;
        let (h1, _) = svc
            .create(&client(), root, &wire("locked.bin"), &file_rw())
            .await
            .unwrap();
        let (h2, _) = svc
            .create(&client(), root, &wire("locked.bin"), &file_rw())
            .await
            .unwrap();

        svc.lock(&client(), h1, 0, 100, true).await.unwrap();

        let err = svc.lock(&client(), h2, 50, 10, true).await.unwrap_err();
        assert!(matches!(err, RedirError::LockConflict(_)));

        svc.lock(&client(), h2, 100, 100, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_respects_foreign_lock() {
        let (svc, root, _tmp) = create_service().await;
        let (h1, _) = svc
            .create(&client(), root, &wire("guarded.bin"), &file_rw())
            .await
            .unwrap();
        let (h2, _) = svc
            .create(&client(), root, &wire("guarded.bin"), &file_rw())
            .await
            .unwrap();

        svc.lock(&client(), h1, 0, 10, true).await.unwrap();

        let err = svc.write(&client(), h2, 5, b"x").await.unwrap_err();
        assert!(matches!(err, RedirError::LockConflict(_)));
        // The lock owner itself may write.
        svc.write(&client(), h1, 5, b"x").await.unwrap();
        // And the range past the lock is open to everyone.
        svc.write(&client(), h2, 10, b"y").await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_exact_match_only() {
        let (svc, root, _tmp) = create_service().await;
        let (handle, _) = svc
            .create(&client(), root, &wire("l.bin"), &file_rw())
            .await
            .unwrap();
        svc.lock(&client(), handle, 0, 100, true).await.unwrap();

        let err = svc.unlock(&client(), handle, 0, 99).await.unwrap_err();
        assert!(matches!(err, RedirError::NotLocked(_)));
        svc.unlock(&client(), handle, 0, 100).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_locks() {
        let (svc, root, _tmp) = create_service().await;
        let (h1, _) = svc
            .create(&client(), root, &wire("rel.bin"), &file_rw())
            .await
            .unwrap();
        let (h2, _) = svc
            .create(&client(), root, &wire("rel.bin"), &file_rw())
            .await
            .unwrap();

        svc.lock(&client(), h1, 0, 100, true).await.unwrap();
        svc.close(&client(), h1).await.unwrap();

        svc.lock(&client(), h2, 0, 100, true).await.unwrap();
    }

    // ==================== Copy Tests ====================

    #[tokio::test]
    async fn test_copy_file_part_across_roots() {
        let (svc, src_root, _tmp) = create_service().await;
        let other = TempDir::new().unwrap();
        let dst_root = share_root(&svc, &other, true).await;

        let (src, _) = svc
            .create(&client(), src_root, &wire("src.bin"), &file_rw())
            .await
            .unwrap();
        let payload = vec![7u8; 300 * 1024];
        svc.write(&client(), src, 0, &payload).await.unwrap();

        let (dst, _) = svc
            .create(&client(), dst_root, &wire("dst.bin"), &file_rw())
            .await
            .unwrap();

        let outcome = svc
            .copy_file_part(&client(), src, 0, dst, 0, payload.len() as u64)
            .await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.transferred, payload.len() as u64);

        let copied = svc
            .read(&client(), dst, 0, payload.len() as u32)
            .await
            .unwrap();
        assert_eq!(copied, payload);
    }

    #[tokio::test]
    async fn test_copy_file_part_stops_at_source_eof() {
        let (svc, root, _tmp) = create_service().await;
        let (src, _) = svc
            .create(&client(), root, &wire("short.bin"), &file_rw())
            .await
            .unwrap();
        svc.write(&client(), src, 0, b"abcdef").await.unwrap();
        let (dst, _) = svc
            .create(&client(), root, &wire("out.bin"), &file_rw())
            .await
            .unwrap();

        let outcome = svc.copy_file_part(&client(), src, 0, dst, 0, 1000).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.transferred, 6);
    }

    #[tokio::test]
    async fn test_copy_file_by_name() {
        let (svc, root, tmp) = create_service().await;
        std::fs::write(tmp.path().join("orig.txt"), b"payload").unwrap();

        let bytes = svc
            .copy_file(
                &client(),
                root,
                &wire("orig.txt"),
                root,
                &wire("copy.txt"),
            )
            .await
            .unwrap();
        assert_eq!(bytes, 7);
        assert_eq!(
            std::fs::read(tmp.path().join("copy.txt")).unwrap(),
            b"payload"
        );
    }

    // ==================== Rename/Remove Tests ====================

    #[tokio::test]
    async fn test_rename_with_bad_destination_touches_nothing() {
        let (svc, root, tmp) = create_service().await;
        std::fs::write(tmp.path().join("keep.txt"), b"original").unwrap();

        let err = svc
            .rename(
                &client(),
                root,
                &wire("keep.txt"),
                &wire("../outside.txt"),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RedirError::InvalidPath(_)));
        assert_eq!(
            std::fs::read(tmp.path().join("keep.txt")).unwrap(),
            b"original"
        );
    }

    #[tokio::test]
    async fn test_rename_without_replace_rejects_existing_target() {
        let (svc, root, tmp) = create_service().await;
        std::fs::write(tmp.path().join("a.txt"), b"a").unwrap();
        std::fs::write(tmp.path().join("b.txt"), b"b").unwrap();

        let err = svc
            .rename(&client(), root, &wire("a.txt"), &wire("b.txt"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, RedirError::AlreadyExists(_)));

        svc.rename(&client(), root, &wire("a.txt"), &wire("b.txt"), true)
            .await
            .unwrap();
        assert_eq!(std::fs::read(tmp.path().join("b.txt")).unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_remove_with_close_first() {
        let (svc, root, tmp) = create_service().await;
        let (handle, _) = svc
            .create(&client(), root, &wire("doomed.txt"), &file_rw())
            .await
            .unwrap();

        svc.remove(&client(), root, &wire("doomed.txt"), false, Some(handle))
            .await
            .unwrap();
        assert!(!tmp.path().join("doomed.txt").exists());

        let err = svc.close(&client(), handle).await.unwrap_err();
        assert!(matches!(err, RedirError::InvalidHandle(_)));
    }

    #[tokio::test]
    async fn test_remove_nonempty_directory() {
        let (svc, root, tmp) = create_service().await;
        std::fs::create_dir(tmp.path().join("full")).unwrap();
        std::fs::write(tmp.path().join("full/x"), b"x").unwrap();

        let err = svc
            .remove(&client(), root, &wire("full"), true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RedirError::NotEmpty(_)));
    }

    // ==================== Read-Only Root Tests ====================

    async fn create_read_only_service() -> (RedirectorService, RootId, TempDir) {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("existing.txt"), b"frozen").unwrap();
        let svc = RedirectorService::new(Arc::new(RootTable::new()));
        let root = svc
            .roots()
            .share(RootConfig {
                name: "ro".to_string(),
                base_path: tmp.path().to_path_buf(),
                case_sensitive: true,
                read_only: true,
            })
            .await
            .unwrap();
        svc.client_connected(&client()).await.unwrap();
        (svc, root, tmp)
    }

    #[tokio::test]
    async fn test_read_only_root_denies_writes() {
        let (svc, root, _tmp) = create_read_only_service().await;

        let err = svc
            .create(&client(), root, &wire("new.txt"), &file_rw())
            .await
            .unwrap_err();
        assert!(matches!(err, RedirError::AccessDenied(_)));

        let (handle, info) = svc
            .create(&client(), root, &wire("existing.txt"), &file_ro())
            .await
            .unwrap();
        assert_eq!(info.size, 6);
        let data = svc.read(&client(), handle, 0, 6).await.unwrap();
        assert_eq!(data, b"frozen");

        let err = svc.write(&client(), handle, 0, b"thaw").await.unwrap_err();
        assert!(matches!(err, RedirError::AccessDenied(_)));

        let err = svc
            .remove(&client(), root, &wire("existing.txt"), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RedirError::AccessDenied(_)));
    }

    // ==================== Root Lifecycle Tests ====================

    #[tokio::test]
    async fn test_unshare_retains_live_handles() {
        let (svc, root, _tmp) = create_service().await;
        let (handle, _) = svc
            .create(&client(), root, &wire("held.txt"), &file_rw())
            .await
            .unwrap();
        svc.write(&client(), handle, 0, b"kept").await.unwrap();

        svc.roots().unshare(root).await.unwrap();

        // New name-based operations fail, the live handle keeps working.
        let err = svc
            .create(&client(), root, &wire("more.txt"), &file_rw())
            .await
            .unwrap_err();
        assert!(matches!(err, RedirError::NoSuchRoot(_)));

        let data = svc.read(&client(), handle, 0, 4).await.unwrap();
        assert_eq!(data, b"kept");
        svc.close(&client(), handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_mappings_report_active_roots() {
        let (svc, root, _tmp) = create_service().await;
        let mappings = svc.list_roots(&client()).await.unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].root_id, root);
        assert!(mappings[0].writable);

        svc.roots().unshare(root).await.unwrap();
        assert!(svc.list_roots(&client()).await.unwrap().is_empty());
    }

    // ==================== Metadata Tests ====================

    #[tokio::test]
    async fn test_query_path_info_without_open() {
        let (svc, root, tmp) = create_service().await;
        std::fs::write(tmp.path().join("stat.me"), b"12345").unwrap();

        let info = svc
            .query_path_info(&client(), root, &wire("stat.me"))
            .await
            .unwrap();
        assert_eq!(info.kind, EntryKind::File);
        assert_eq!(info.size, 5);

        let err = svc
            .query_path_info(&client(), root, &wire("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, RedirError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_set_file_info_patch() {
        let (svc, root, _tmp) = create_service().await;
        let (handle, _) = svc
            .create(&client(), root, &wire("attrs.txt"), &file_rw())
            .await
            .unwrap();
        svc.write(&client(), handle, 0, b"abcdef").await.unwrap();

        let patch = redir_lib::FileInfoPatch {
            size: Some(2),
            modified: Some(1_000_000),
            ..Default::default()
        };
        let info = svc.set_file_info(&client(), handle, &patch).await.unwrap();
        assert_eq!(info.size, 2);
        assert_eq!(info.modified, 1_000_000);
    }

    #[tokio::test]
    async fn test_set_fs_info_is_unsupported() {
        let (svc, root, _tmp) = create_service().await;
        let (handle, _) = svc
            .create(&client(), root, &wire(""), &dir_open())
            .await
            .unwrap();
        let err = svc.set_fs_info(&client(), handle).await.unwrap_err();
        assert!(matches!(err, RedirError::Unsupported(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fs_info_reports_volume_sizes() {
        let (svc, root, _tmp) = create_service().await;
        let (handle, _) = svc
            .create(&client(), root, &wire(""), &dir_open())
            .await
            .unwrap();
        let props = svc.query_fs_info(&client(), handle).await.unwrap();
        assert!(props.total_bytes > 0);
        assert!(props.case_sensitive);
        assert!(!props.read_only);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_round_trip() {
        let (svc, root, tmp) = create_service().await;
        std::fs::write(tmp.path().join("target.txt"), b"pointed-at").unwrap();

        let info = svc
            .symlink(&client(), root, &wire("link.txt"), &wire("target.txt"))
            .await
            .unwrap();
        assert_eq!(info.kind, EntryKind::Symlink);

        let target = svc
            .read_link(&client(), root, &wire("link.txt"))
            .await
            .unwrap();
        assert_eq!(target, "target.txt");

        // The link resolves inside the root.
        assert_eq!(
            std::fs::read(tmp.path().join("link.txt")).unwrap(),
            b"pointed-at"
        );
    }
}
