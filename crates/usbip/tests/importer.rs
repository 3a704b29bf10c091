//! Importer session tests: a scripted remote exporter on one end of a
//! duplex stream, a loopback virtual-port sink on the other.

use protocol::device::{DeviceInterface, DeviceRecord, DeviceSpeed};
use protocol::net;
use protocol::op::{DevlistReply, ImportReply, OpRequest};
use protocol::urb::{
    Direction, SubmitReply, SubmitRequest, UnlinkReply, UrbId, UrbReply, UrbRequest,
};
use tokio::sync::watch;
use usbip::importer::{self, ImporterOptions, Loopback, Sink};

fn exported_device() -> DeviceRecord {
    DeviceRecord {
        path: "/sys/bus/usb/devices/1-2".to_string(),
        busid: "1-2".to_string(),
        busnum: 1,
        devnum: 2,
        speed: DeviceSpeed::High,
        vendor_id: 0x0781,
        product_id: 0x5591,
        bcd_device: 0x0100,
        device_class: 0x08,
        device_subclass: 0x06,
        device_protocol: 0x50,
        configuration_value: 1,
        num_configurations: 1,
        num_interfaces: 1,
        interfaces: vec![DeviceInterface {
            class: 0x08,
            subclass: 0x06,
            protocol: 0x50,
        }],
    }
}

/// Device body as an IMPORT reply carries it: interface count only.
fn imported_device() -> DeviceRecord {
    let mut record = exported_device();
    record.interfaces = Vec::new();
    record
}

#[tokio::test]
async fn imports_first_listed_device_and_relays_urbs() {
    let (client_stream, mut remote) = tokio::io::duplex(1 << 16);
    let (loopback, driver) = Loopback::new(0);
    let sink = Sink::Loopback(loopback);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    // The remote exporter, scripted.
    let remote_task = tokio::spawn(async move {
        let request = net::read_op_request(&mut remote).await.unwrap();
        assert_eq!(request, OpRequest::Devlist);
        net::write_devlist_reply(&mut remote, &DevlistReply::new(vec![exported_device()]))
            .await
            .unwrap();

        let request = net::read_op_request(&mut remote).await.unwrap();
        assert_eq!(
            request,
            OpRequest::Import {
                busid: "1-2".to_string()
            }
        );
        net::write_import_reply(&mut remote, &ImportReply::ok(imported_device()))
            .await
            .unwrap();

        // One URB arrives from the virtual port and gets completed.
        let UrbRequest::Submit(submit) = net::read_urb_request(&mut remote).await.unwrap()
        else {
            panic!("expected CMD_SUBMIT");
        };
        assert_eq!(submit.id.seqnum, 77);
        assert_eq!(submit.transfer_buffer_length, 18);

        let reply = UrbReply::Submit(SubmitReply {
            id: submit.id,
            status: 0,
            actual_length: 18,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            setup: submit.setup,
            payload: vec![0x42; 18],
        });
        net::write_urb_reply(&mut remote, &reply).await.unwrap();
        remote
    });

    let session = tokio::spawn(async move {
        importer::run(client_stream, &sink, ImporterOptions::default(), shutdown_rx).await
    });

    // Play the kernel: submit one control-IN URB, await its completion.
    driver
        .urb_tx
        .send(UrbRequest::Submit(SubmitRequest {
            id: UrbId {
                seqnum: 77,
                devid: (1 << 16) | 2,
                direction: Direction::In,
                ep: 0,
            },
            transfer_flags: 0,
            transfer_buffer_length: 18,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
            payload: Vec::new(),
        }))
        .await
        .unwrap();

    let UrbReply::Submit(completion) = driver.completion_rx.recv().await.unwrap() else {
        panic!("expected RET_SUBMIT");
    };
    assert_eq!(completion.id.seqnum, 77);
    assert_eq!(completion.actual_length, 18);
    assert_eq!(completion.payload, vec![0x42; 18]);

    // Remote hangs up; the session winds down cleanly.
    let remote = remote_task.await.unwrap();
    drop(remote);
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn explicit_busid_skips_devlist() {
    let (client_stream, mut remote) = tokio::io::duplex(1 << 16);
    let (loopback, driver) = Loopback::new(0);
    let sink = Sink::Loopback(loopback);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let remote_task = tokio::spawn(async move {
        // First frame is the import itself.
        let request = net::read_op_request(&mut remote).await.unwrap();
        assert_eq!(
            request,
            OpRequest::Import {
                busid: "1-2".to_string()
            }
        );
        net::write_import_reply(&mut remote, &ImportReply::ok(imported_device()))
            .await
            .unwrap();
        remote
    });

    let session = tokio::spawn(async move {
        importer::run(
            client_stream,
            &sink,
            ImporterOptions {
                busid: Some("1-2".to_string()),
            },
            shutdown_rx,
        )
        .await
    });

    let remote = remote_task.await.unwrap();
    drop(remote);
    drop(driver);
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn refused_import_fails_the_session() {
    let (client_stream, mut remote) = tokio::io::duplex(1 << 16);
    let (loopback, _driver) = Loopback::new(0);
    let sink = Sink::Loopback(loopback);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let _ = net::read_op_request(&mut remote).await.unwrap();
        net::write_import_reply(&mut remote, &ImportReply::failed(1))
            .await
            .unwrap();
        // Keep the stream open long enough for the client to read.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    });

    let err = importer::run(
        client_stream,
        &sink,
        ImporterOptions {
            busid: Some("9-9".to_string()),
        },
        shutdown_rx,
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        importer::ImportError::Refused { status: 1 }
    ));
}

#[tokio::test]
async fn empty_devlist_fails_the_session() {
    let (client_stream, mut remote) = tokio::io::duplex(1 << 16);
    let (loopback, _driver) = Loopback::new(0);
    let sink = Sink::Loopback(loopback);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let _ = net::read_op_request(&mut remote).await.unwrap();
        net::write_devlist_reply(&mut remote, &DevlistReply::new(Vec::new()))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    });

    let err = importer::run(
        client_stream,
        &sink,
        ImporterOptions::default(),
        shutdown_rx,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, importer::ImportError::NoDevices));
}

#[tokio::test]
async fn unlink_round_trips_through_the_relay() {
    let (client_stream, mut remote) = tokio::io::duplex(1 << 16);
    let (loopback, driver) = Loopback::new(0);
    let sink = Sink::Loopback(loopback);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let remote_task = tokio::spawn(async move {
        let _ = net::read_op_request(&mut remote).await.unwrap();
        net::write_import_reply(&mut remote, &ImportReply::ok(imported_device()))
            .await
            .unwrap();

        let UrbRequest::Unlink(unlink) = net::read_urb_request(&mut remote).await.unwrap()
        else {
            panic!("expected CMD_UNLINK");
        };
        assert_eq!(unlink.victim_seqnum, 5);

        net::write_urb_reply(
            &mut remote,
            &UrbReply::Unlink(UnlinkReply {
                id: unlink.id,
                status: 0,
            }),
        )
        .await
        .unwrap();
        remote
    });

    let session = tokio::spawn(async move {
        importer::run(
            client_stream,
            &sink,
            ImporterOptions {
                busid: Some("1-2".to_string()),
            },
            shutdown_rx,
        )
        .await
    });

    driver
        .urb_tx
        .send(UrbRequest::Unlink(protocol::urb::UnlinkRequest {
            id: UrbId {
                seqnum: 6,
                devid: (1 << 16) | 2,
                direction: Direction::Out,
                ep: 0,
            },
            victim_seqnum: 5,
        }))
        .await
        .unwrap();

    let UrbReply::Unlink(reply) = driver.completion_rx.recv().await.unwrap() else {
        panic!("expected RET_UNLINK");
    };
    assert_eq!(reply.id.seqnum, 6);

    let remote = remote_task.await.unwrap();
    drop(remote);
    drop(driver);
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_signal_ends_relay() {
    let (client_stream, mut remote) = tokio::io::duplex(1 << 16);
    let (loopback, _driver) = Loopback::new(0);
    let sink = Sink::Loopback(loopback);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let remote_task = tokio::spawn(async move {
        let _ = net::read_op_request(&mut remote).await.unwrap();
        net::write_import_reply(&mut remote, &ImportReply::ok(imported_device()))
            .await
            .unwrap();
        // Hold the connection open until the far side goes away.
        let mut buf = [0u8; 1];
        use tokio::io::AsyncReadExt;
        let _ = remote.read(&mut buf).await;
    });

    let session = tokio::spawn(async move {
        importer::run(
            client_stream,
            &sink,
            ImporterOptions {
                busid: Some("1-2".to_string()),
            },
            shutdown_rx,
        )
        .await
    });

    // Let the handshake finish, then pull the plug.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    shutdown_tx.send(true).unwrap();

    session.await.unwrap().unwrap();
    remote_task.await.unwrap();
}
