// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end scenarios exercising a `Reader`/`Writer` pair across the
//! parts of the protocol a unit test inside a single module cannot reach:
//! real shared memory segments, real named semaphores, and genuine
//! wrap-around.

use std::time::Duration;

use zerobuffer::duplex::{DuplexClient, DuplexServer};
use zerobuffer::{BufferConfig, Reader, Writer, ZeroBufferError};

fn unique_name(prefix: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    format!("zb_it_{prefix}_{ts}_{}", std::process::id())
}

#[test]
fn simple_write_read_round_trip() {
    let name = unique_name("s1");
    let reader = Reader::create(&name, BufferConfig::new(64, 4096).unwrap()).unwrap();
    let mut writer = Writer::attach(&name).unwrap();

    writer.set_metadata(b"v1").unwrap();
    assert_eq!(reader.read_metadata(), b"v1");

    for i in 0..10u8 {
        writer.write_frame(&[i; 32], Duration::from_secs(1)).unwrap();
    }
    for i in 0..10u8 {
        let frame = reader.read_frame(Duration::from_secs(1)).unwrap();
        assert_eq!(frame.payload(), &[i; 32]);
        assert_eq!(frame.sequence(), u64::from(i) + 1);
        reader.release_frame(frame).unwrap();
    }
    writer.close();
    reader.close();
}

#[test]
fn wrap_around_reuses_space_after_release() {
    // A small ring forces a wrap well within the test's frame count:
    // capacity 512, each frame is 16 (header) + 100 = 116 bytes, so under
    // five frames fit before the tail run is too small for a sixth.
    let name = unique_name("wrap");
    let reader = Reader::create(&name, BufferConfig::new(0, 512).unwrap()).unwrap();
    let mut writer = Writer::attach(&name).unwrap();

    for round in 0..20u32 {
        let payload = vec![(round % 251) as u8; 100];
        writer.write_frame(&payload, Duration::from_secs(1)).unwrap();
        let frame = reader.read_frame(Duration::from_secs(1)).unwrap();
        assert_eq!(frame.payload(), payload.as_slice());
        assert_eq!(frame.sequence(), u64::from(round) + 1);
        reader.release_frame(frame).unwrap();
    }

    let stats = reader.stats();
    assert_eq!(stats.payload_written_count, 20);
    assert_eq!(stats.payload_read_count, 20);
    assert_eq!(stats.payload_free_bytes, 512);

    writer.close();
    reader.close();
}

#[test]
fn frame_too_large_for_capacity_is_rejected() {
    let name = unique_name("toolarge");
    let reader = Reader::create(&name, BufferConfig::new(0, 128).unwrap()).unwrap();
    let mut writer = Writer::attach(&name).unwrap();

    let result = writer.try_write_frame(&vec![0u8; 200]);
    assert!(matches!(result, Err(ZeroBufferError::FrameTooLarge { .. })));

    writer.close();
    reader.close();
}

#[test]
fn non_blocking_write_reports_buffer_full() {
    let name = unique_name("full");
    let reader = Reader::create(&name, BufferConfig::new(0, 256).unwrap()).unwrap();
    let mut writer = Writer::attach(&name).unwrap();

    // Fill the ring without the reader draining it.
    loop {
        match writer.try_write_frame(&[0u8; 64]) {
            Ok(()) => continue,
            Err(ZeroBufferError::BufferFull) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert!(matches!(writer.try_write_frame(&[0u8; 64]), Err(ZeroBufferError::BufferFull)));

    // Draining one frame must free enough room for another write.
    let frame = reader.read_frame(Duration::from_secs(1)).unwrap();
    reader.release_frame(frame).unwrap();
    writer.try_write_frame(&[0u8; 64]).unwrap();

    writer.close();
    reader.close();
}

#[test]
fn reader_detects_writer_death() {
    let name = unique_name("writerdeath");
    let reader = Reader::create(&name, BufferConfig::new(0, 4096).unwrap()).unwrap();
    {
        let writer = Writer::attach(&name).unwrap();
        drop(writer);
    }
    // The writer slot is released on drop, so the reader no longer sees a
    // connected writer and should treat a subsequent wait as "nothing left
    // to wait for" rather than hanging.
    assert!(!reader.is_writer_connected());
    reader.close();
}

#[test]
fn second_writer_is_rejected_while_first_is_alive() {
    let name = unique_name("secondwriter");
    let reader = Reader::create(&name, BufferConfig::new(0, 4096).unwrap()).unwrap();
    let _writer = Writer::attach(&name).unwrap();
    let second = Writer::attach(&name);
    assert!(matches!(second, Err(ZeroBufferError::WriterAlreadyConnected)));
    reader.close();
}

#[test]
fn duplex_handles_several_requests_in_order() {
    let base = unique_name("duplex");
    let config = BufferConfig::new(0, 4096).unwrap();
    let mut server = DuplexServer::create(&base, config).unwrap();

    let client_thread = std::thread::spawn({
        let base = base.clone();
        move || {
            let mut client = DuplexClient::connect(&base, config, Duration::from_secs(2)).unwrap();
            for i in 0..5u8 {
                let reply = client
                    .send_receive(&[i], Duration::from_secs(2))
                    .unwrap();
                assert_eq!(reply, vec![i, i]);
            }
        }
    });

    server.accept(Duration::from_secs(2)).unwrap();
    for _ in 0..5 {
        server
            .process_once(Duration::from_secs(2), |req| vec![req[0], req[0]])
            .unwrap();
    }

    client_thread.join().unwrap();
}
