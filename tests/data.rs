use std::path::{Path, PathBuf};

use bytes::BytesMut;
use color_eyre::{eyre::eyre, Result};
use port_agent::{
    agent::connectivity::LinkState,
    codecs::framed::PacketCodec,
    endpoint::EndpointType,
    packet::{Packet, PacketType},
};
use pretty_assertions::assert_eq;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::{timeout, Duration},
};
use tokio_util::codec::Decoder;

mod common;

#[tokio::test]
async fn instrument_data_reaches_driver() -> Result<()> {
    let (listener, port) = common::instrument().await?;
    let agent = common::start(common::tcp_config(port)).await?;

    let mut driver = common::connect(agent.ports().data).await?;
    common::wait_for_adds(&agent, EndpointType::Client, 1).await?;

    let mut instrument = common::accept(&listener).await?;
    common::wait_for_adds(&agent, EndpointType::Instrument, 1).await?;

    instrument.write_all(b"hello").await?;

    let payload = common::receive_payload(&mut driver, PacketType::FromInstrument, 5).await?;
    assert_eq!(payload, b"hello");

    Ok(())
}

#[tokio::test]
async fn driver_data_reaches_instrument_unframed() -> Result<()> {
    let (listener, port) = common::instrument().await?;
    let agent = common::start(common::tcp_config(port)).await?;

    let mut instrument = common::accept(&listener).await?;
    common::wait_for_adds(&agent, EndpointType::Instrument, 1).await?;

    let mut driver = common::connect(agent.ports().data).await?;
    driver.get_mut().write_all(b"start\r\n").await?;

    assert_eq!(common::read_exact(&mut instrument, 7).await?, b"start\r\n");

    Ok(())
}

#[tokio::test]
async fn driver_is_told_about_connectivity() -> Result<()> {
    let (listener, port) = common::instrument().await?;
    let agent = common::start(common::tcp_config(port)).await?;

    let mut driver = common::connect(agent.ports().data).await?;
    common::wait_for_adds(&agent, EndpointType::Client, 1).await?;

    let instrument = common::accept(&listener).await?;
    let status = common::receive_type(&mut driver, PacketType::PaStatus).await?;
    assert_eq!(status.payload().as_ref(), b"CONNECTED");

    drop(instrument);
    let status = common::receive_type(&mut driver, PacketType::PaStatus).await?;
    assert_eq!(status.payload().as_ref(), b"DISCONNECTED");

    // The agent reconnects by itself.
    let _instrument = common::accept(&listener).await?;
    let status = common::receive_type(&mut driver, PacketType::PaStatus).await?;
    assert_eq!(status.payload().as_ref(), b"CONNECTED");

    Ok(())
}

#[tokio::test]
async fn two_drivers_both_receive() -> Result<()> {
    let (listener, port) = common::instrument().await?;
    let agent = common::start(common::tcp_config(port)).await?;

    let mut first = common::connect(agent.ports().data).await?;
    let mut second = common::connect(agent.ports().data).await?;
    common::wait_for_adds(&agent, EndpointType::Client, 2).await?;

    let mut instrument = common::accept(&listener).await?;
    common::wait_for_state(&agent, LinkState::Connected).await?;
    instrument.write_all(b"42.0").await?;

    for driver in [&mut first, &mut second] {
        let payload = common::receive_payload(driver, PacketType::FromInstrument, 4).await?;
        assert_eq!(payload, b"42.0");
    }

    Ok(())
}

#[tokio::test]
async fn sniffer_sees_ascii() -> Result<()> {
    let (listener, port) = common::instrument().await?;
    let agent = common::start(common::tcp_config(port)).await?;

    let sniffer = TcpStream::connect(("127.0.0.1", agent.ports().sniff)).await?;
    common::wait_for_adds(&agent, EndpointType::Sniffer, 1).await?;

    let mut instrument = common::accept(&listener).await?;
    common::wait_for_state(&agent, LinkState::Connected).await?;
    instrument.write_all(b"hello").await?;

    let mut lines = BufReader::new(sniffer).lines();
    let line = loop {
        let line = timeout(Duration::from_secs(5), lines.next_line())
            .await??
            .ok_or_else(|| color_eyre::eyre::eyre!("Sniffer closed"))?;
        if line.starts_with(r#"<packet type="DATA_FROM_INSTRUMENT""#) {
            break line;
        }
    };

    assert!(line.ends_with(r#"length="5">hello</packet>"#), "{line}");

    Ok(())
}

#[tokio::test]
async fn raw_port_is_optional() -> Result<()> {
    let (_listener, port) = common::instrument().await?;

    let agent = common::start(common::tcp_config(port)).await?;
    assert_eq!(agent.ports().raw, None);

    let mut config = common::tcp_config(port);
    config.ports.raw = Some(0);
    let agent = common::start(config).await?;
    assert!(agent.ports().raw.is_some());

    Ok(())
}

/// The contents of the log file in `dir` with the given suffix, once it holds `needle`.
async fn log_file_containing(dir: &Path, suffix: &str, needle: &[u8]) -> Result<(PathBuf, Vec<u8>)> {
    let poll = async {
        loop {
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|extension| extension == suffix) {
                    let contents = std::fs::read(&path)?;
                    if contents.windows(needle.len()).any(|window| window == needle) {
                        return Ok::<_, color_eyre::Report>((path, contents));
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };

    timeout(Duration::from_secs(5), poll)
        .await
        .map_err(|_| eyre!("No .{suffix} file with the expected contents"))?
}

#[tokio::test]
async fn instrument_data_is_logged_as_text_and_packets() -> Result<()> {
    let dir = std::env::temp_dir().join(format!("port-agent-data-{}", uuid::Uuid::new_v4()));

    let (listener, port) = common::instrument().await?;
    let mut config = common::tcp_config(port);
    config.log_dir = Some(dir.clone());
    let agent = common::start(config).await?;

    let mut instrument = common::accept(&listener).await?;
    common::wait_for_adds(&agent, EndpointType::Instrument, 1).await?;
    instrument.write_all(b"hello").await?;

    let (path, text) = log_file_containing(&dir, "log", b"length=\"5\">hello</packet>\n").await?;
    let name = path.file_name().map(|name| name.to_string_lossy().into_owned());
    assert!(name.is_some_and(|name| name.starts_with(&format!("{}.", common::REFDES))));
    let text = String::from_utf8(text)?;
    assert!(text
        .lines()
        .any(|line| line.starts_with("<packet type=\"DATA_FROM_INSTRUMENT\" time=\"")));

    let (_, frames) = log_file_containing(&dir, "datalog", b"hello").await?;
    let mut frames = BytesMut::from(&frames[..]);
    let mut codec = PacketCodec::new();
    let mut packets: Vec<Packet> = vec![];
    while let Some(packet) = codec.decode(&mut frames)? {
        packets.push(packet);
    }

    assert_eq!(codec.dropped(), 0);
    assert!(packets.iter().any(|packet| {
        packet.packet_type() == PacketType::FromInstrument && packet.payload().as_ref() == b"hello"
    }));

    std::fs::remove_dir_all(&dir)?;

    Ok(())
}
