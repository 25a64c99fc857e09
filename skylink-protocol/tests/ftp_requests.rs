//! FTP engine behaviour against an in-process server

mod support;

use bytes::Bytes;
use skylink_protocol::ftp::{FtpConfig, FtpEntryKind, FtpItf, FtpStatus, PutSource};
use support::ftp_server::FakeFtpServer;

fn engine() -> FtpItf {
    FtpItf::new(FtpConfig::default())
}

#[tokio::test]
async fn test_get_to_buffer() {
    let server = FakeFtpServer::start().await;
    server.add_file("/log/a.bin", b"hello drone");

    let result = engine()
        .get("127.0.0.1", server.port, "/log/a.bin", None, false)
        .wait()
        .await;
    assert_eq!(result.status, FtpStatus::Ok);
    assert_eq!(result.data.unwrap(), Bytes::from_static(b"hello drone"));
    assert_eq!(result.size, Some(11));
}

#[tokio::test]
async fn test_get_with_resume_appends_tail() {
    let server = FakeFtpServer::start().await;
    let full: Vec<u8> = (0..=255u8).cycle().take(500).collect();
    server.add_file("/log/a.bin", &full);

    // Local file already holds the first 100 bytes.
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("a.bin");
    tokio::fs::write(&local, &full[..100]).await.unwrap();

    let result = engine()
        .get(
            "127.0.0.1",
            server.port,
            "/log/a.bin",
            Some(local.clone()),
            true,
        )
        .wait()
        .await;
    assert_eq!(result.status, FtpStatus::Ok);
    assert_eq!(result.size, Some(500));
    let on_disk = tokio::fs::read(&local).await.unwrap();
    assert_eq!(on_disk, full);
}

#[tokio::test]
async fn test_get_missing_file_fails_with_code() {
    let server = FakeFtpServer::start().await;
    let result = engine()
        .get("127.0.0.1", server.port, "/log/missing.bin", None, false)
        .wait()
        .await;
    assert_eq!(result.status, FtpStatus::Failed(550));
}

#[tokio::test]
async fn test_put_from_buffer_and_size() {
    let server = FakeFtpServer::start().await;
    let itf = engine();

    let result = itf
        .put(
            "127.0.0.1",
            server.port,
            "/upload/data.bin",
            PutSource::Buffer(Bytes::from_static(b"payload")),
            false,
        )
        .wait()
        .await;
    assert_eq!(result.status, FtpStatus::Ok);
    assert_eq!(server.file("/upload/data.bin").unwrap(), b"payload");

    let result = itf
        .size("127.0.0.1", server.port, "/upload/data.bin")
        .wait()
        .await;
    assert_eq!(result.status, FtpStatus::Ok);
    assert_eq!(result.size, Some(7));
}

#[tokio::test]
async fn test_put_resume_appends_from_remote_size() {
    let server = FakeFtpServer::start().await;
    server.add_file("/upload/data.bin", b"01234");

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("data.bin");
    tokio::fs::write(&local, b"0123456789").await.unwrap();

    let result = engine()
        .put(
            "127.0.0.1",
            server.port,
            "/upload/data.bin",
            PutSource::File(local),
            true,
        )
        .wait()
        .await;
    assert_eq!(result.status, FtpStatus::Ok);
    assert_eq!(server.file("/upload/data.bin").unwrap(), b"0123456789");
}

#[tokio::test]
async fn test_list_entries() {
    let server = FakeFtpServer::start().await;
    server.add_file("/media/a.jpg", &[0u8; 100]);
    server.add_file("/media/b.mp4", &[0u8; 2000]);
    server.add_file("/media/sub/nested.bin", &[0u8; 1]);

    let result = engine()
        .list("127.0.0.1", server.port, "/media")
        .wait()
        .await;
    assert_eq!(result.status, FtpStatus::Ok);
    let entries = result.entries.unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries
        .iter()
        .any(|e| e.name == "a.jpg" && e.size == 100 && e.kind == FtpEntryKind::File));
    assert!(entries
        .iter()
        .any(|e| e.name == "sub" && e.kind == FtpEntryKind::Dir));
}

#[tokio::test]
async fn test_rename_and_delete() {
    let server = FakeFtpServer::start().await;
    server.add_file("/update/fw.puf.tmp", b"firmware");
    let itf = engine();

    let result = itf
        .rename("127.0.0.1", server.port, "/update/fw.puf.tmp", "fw.puf")
        .wait()
        .await;
    assert_eq!(result.status, FtpStatus::Ok);
    assert!(server.has_file("/update/fw.puf"));
    assert!(!server.has_file("/update/fw.puf.tmp"));

    let result = itf
        .delete("127.0.0.1", server.port, "/update/fw.puf")
        .wait()
        .await;
    assert_eq!(result.status, FtpStatus::Ok);
    assert!(!server.has_file("/update/fw.puf"));
}

#[tokio::test]
async fn test_delete_directory_with_trailing_slash() {
    let server = FakeFtpServer::start().await;
    server.add_file("/crash/report.0/log.txt", b"boom");

    let result = engine()
        .delete("127.0.0.1", server.port, "/crash/report.0/")
        .wait()
        .await;
    assert_eq!(result.status, FtpStatus::Ok);
    assert!(!server.has_file("/crash/report.0/log.txt"));
}

#[tokio::test]
async fn test_cancel_reports_canceled() {
    let server = FakeFtpServer::start().await;
    server.add_file("/log/a.bin", &[0u8; 64]);

    let request = engine().get("127.0.0.1", server.port, "/log/a.bin", None, false);
    request.cancel();
    let result = request.wait().await;
    // Depending on timing the transfer may have already completed.
    assert!(matches!(result.status, FtpStatus::Canceled | FtpStatus::Ok));
}

#[tokio::test]
async fn test_stop_aborts_new_requests() {
    let server = FakeFtpServer::start().await;
    let itf = engine();
    itf.stop().await;
    let result = itf
        .get("127.0.0.1", server.port, "/log/a.bin", None, false)
        .wait()
        .await;
    assert_eq!(result.status, FtpStatus::Aborted);
}

#[tokio::test]
async fn test_connection_is_pooled() {
    let server = FakeFtpServer::start().await;
    server.add_file("/a", b"1");
    server.add_file("/b", b"2");
    let itf = engine();

    // Two sequential requests ride the same control connection.
    let first = itf.get("127.0.0.1", server.port, "/a", None, false).wait().await;
    let second = itf.get("127.0.0.1", server.port, "/b", None, false).wait().await;
    assert_eq!(first.status, FtpStatus::Ok);
    assert_eq!(second.status, FtpStatus::Ok);
}
