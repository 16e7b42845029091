//! Three simulated stations in a line: an outstation (10), a relay (20) and the
//! base station (30) with a serial host attached.
//!
//! The outstation is out of range of the base. Its weather readings ride along
//! with the relay's own weather messages, its status is relayed frame by frame,
//! and a query sent from the base's host reaches it through the relay.
//!
//! Run with `RUST_LOG=debug cargo run --example three_station_mesh` for the
//! per-message decisions.

use embassy_time::Instant;
use env_logger::Builder;
use futures::executor::block_on;
use log::{Level, LevelFilter, log};
use weather_mesh_radio::config::ConfigFlags;
use weather_mesh_radio::messages::FORCED_RELAY_FLAG;
use weather_mesh_radio::radio_devices::simulator::LinkState;
use weather_mesh_radio::radio_devices::{SimulatedMedium, SimulatedRadio};
use weather_mesh_radio::transport::{KissDecoder, KissFrameKind, KissSource};
use weather_mesh_radio::{
    ChannelAccessConfig, ConfigField, ConfigurationStore, KISS_MAX_PAYLOAD, MemoryConfigStore, MessageLog, NoFirmwareUpdates, ReadingKind,
    RelayConfiguration, RelayList, Services, Station, StationError,
};

type SimStation<'a> = Station<SimulatedRadio<'a, 3>, MemoryConfigStore, MessageLog<32>, NoFirmwareUpdates>;

fn build<'a>(medium: &'a SimulatedMedium<3>, node: usize, station_id: u8, relay_for: &[u8], flags: u8) -> SimStation<'a> {
    let mut config = MemoryConfigStore::with_station_id(station_id);
    if let Some(list) = RelayList::from_slice(relay_for) {
        let _ = config.set(ConfigField::MessageRelayList, &list.0);
        let _ = config.set(ConfigField::WeatherRelayList, &list.0);
    }
    let _ = config.set(ConfigField::Flags, &[flags]);
    let services = Services::new(config, MessageLog::new(), NoFirmwareUpdates);
    Station::new(
        medium.radio(node),
        services,
        ChannelAccessConfig::default(),
        RelayConfiguration::default(),
        0x5EED + node as u64,
    )
}

async fn run<'m>(outstation: &mut SimStation<'m>, relay: &mut SimStation<'m>, base: &mut SimStation<'m>, host: &mut Vec<u8>) -> Result<(), StationError> {
    for station in [&mut *outstation, &mut *relay, &mut *base] {
        station.start().await?;
    }

    for round in 0..6u8 {
        let now = Instant::from_secs(round as u64 * 300);
        if let Some(kind) = outstation.weather_due(now) {
            let reading = match kind {
                ReadingKind::Simple => vec![round * 30, 12],
                ReadingKind::Complex => vec![round * 30, 12, 87, 21, 1],
            };
            let unique_id = outstation.send_weather(&reading).await?;
            log!(Level::Info, "Outstation sent {:?} weather #{}", kind, unique_id);
        }
        if round % 3 == 2 {
            outstation.send_status().await?;
        }

        relay.poll(None).await?;
        if round % 2 == 1 {
            let unique_id = relay.send_weather(&[round * 20, 7]).await?;
            log!(
                Level::Info,
                "Relay sent weather #{} ({} readings waiting)",
                unique_id,
                relay.engine().aggregation().tuple_count()
            );
        }
        base.poll(Some(&mut *host)).await?;
        outstation.poll(None).await?;
    }

    // Volatile state query for the outstation, typed on the base's host
    let query = [FORCED_RELAY_FLAG | b'C', 10, 1, b'Q', b'V'];
    let mut frame = KissSource::new(KissFrameKind::Data as u8, &query);
    base.handle_host_frame(&mut frame, host).await?;
    relay.poll(None).await?;
    outstation.poll(None).await?;
    relay.poll(None).await?;
    base.poll(Some(&mut *host)).await?;
    Ok(())
}

fn main() {
    Builder::new().filter_level(LevelFilter::Info).parse_default_env().init();

    let medium = SimulatedMedium::<3>::new();
    medium.connect(0, 1, LinkState::Clean);
    medium.connect(1, 2, LinkState::Clean);

    let mut outstation = build(&medium, 0, 10, &[], 0);
    let mut relay = build(&medium, 1, 20, &[10], 0);
    // The base relays for the outstation too, which keeps its receiver on for acknowledgments
    let mut base = build(&medium, 2, 30, &[10], ConfigFlags::RECORD_NON_RELAYED | ConfigFlags::HOST_BRIDGE);
    let mut host = Vec::new();

    if let Err(error) = block_on(run(&mut outstation, &mut relay, &mut base, &mut host)) {
        log!(Level::Error, "Mesh run failed: {}", error);
        return;
    }

    for record in base.services().database.iter() {
        log!(
            Level::Info,
            "Base logged {:?} from station {}: {:02X?}",
            record.message_type,
            record.station_id,
            &record.payload[..]
        );
    }

    let mut decoder = KissDecoder::<KISS_MAX_PAYLOAD>::new(0);
    for byte in host {
        match decoder.push(byte) {
            Ok(Some(kind)) => log!(Level::Info, "Host received kind 0x{:02X}: {:02X?}", kind, decoder.frame()),
            Ok(None) => {}
            Err(error) => log!(Level::Warn, "Host stream error: {:?}", error),
        }
    }

    for node in 0..3 {
        log!(
            Level::Info,
            "Node {}: transmitted {}, delivered {}",
            node,
            medium.transmitted(node),
            medium.delivered(node)
        );
    }
}
