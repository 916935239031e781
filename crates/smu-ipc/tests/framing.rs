use smu_ipc::{
    IpcError,
    framing::{MAX_FRAME_SIZE, read_frame, write_frame},
};
use tokio::io::{AsyncWriteExt, BufReader, duplex, sink};

#[tokio::test]
async fn frame_roundtrip() {
    let (mut tx, rx) = duplex(128);
    let mut rx = BufReader::new(rx);
    let payload = br#"{"type":"read"}"#.to_vec();

    let write_task = tokio::spawn(async move { write_frame(&mut tx, &payload).await });
    let read_payload = read_frame(&mut rx).await.expect("read should succeed");

    write_task
        .await
        .expect("join should succeed")
        .expect("write should succeed");
    assert_eq!(read_payload, br#"{"type":"read"}"#);
}

#[tokio::test]
async fn crlf_and_blank_lines_are_tolerated() {
    let (mut tx, rx) = duplex(128);
    let mut rx = BufReader::new(rx);

    tx.write_all(b"\r\n\n{\"type\":\"reset\"}\r\n")
        .await
        .expect("write should succeed");

    let payload = read_frame(&mut rx).await.expect("read should succeed");
    assert_eq!(payload, br#"{"type":"reset"}"#);
}

#[tokio::test]
async fn reject_oversized_frame() {
    let mut writer = sink();
    let payload = vec![b'a'; MAX_FRAME_SIZE + 1];

    let err = write_frame(&mut writer, &payload)
        .await
        .expect_err("oversized frame must fail");

    match err {
        IpcError::FrameTooLarge { .. } => {}
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn reject_oversized_incoming_line() {
    let (mut tx, rx) = duplex(64 * 1024);
    let mut rx = BufReader::new(rx);

    let writer = tokio::spawn(async move {
        let payload = vec![b'a'; MAX_FRAME_SIZE + 16];
        let _ = tx.write_all(&payload).await;
        let _ = tx.write_all(b"\n").await;
    });

    let err = read_frame(&mut rx)
        .await
        .expect_err("oversized line must fail");
    match err {
        IpcError::FrameTooLarge { max, .. } => assert_eq!(max, MAX_FRAME_SIZE),
        other => panic!("unexpected error: {other}"),
    }

    drop(rx);
    let _ = writer.await;
}

#[tokio::test]
async fn detect_truncated_frame_payload() {
    let (mut tx, rx) = duplex(128);
    let mut rx = BufReader::new(rx);

    tx.write_all(b"{\"type\":")
        .await
        .expect("partial payload write should succeed");
    drop(tx);

    let err = read_frame(&mut rx)
        .await
        .expect_err("truncated frame should fail");

    match err {
        IpcError::Io(io_err) => {
            assert_eq!(io_err.kind(), std::io::ErrorKind::UnexpectedEof);
        }
        other => panic!("unexpected error: {other}"),
    }
}
