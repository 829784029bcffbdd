//! UDP collectors for the two wire protocols.
//!
//! Each collector owns one socket shared across a fixed pool of reader
//! tasks. Every worker loops on its own receive buffer, validates the
//! source against the configured agents, decodes the datagram, and emits
//! normalized flows into a bounded channel; a full channel blocks the
//! worker, which is how back-pressure reaches the kernel receive buffer.
//! Protocol errors never escape a worker: they are logged, counted, and the
//! datagram (or the offending part of it) is dropped.

use crate::config::ListenerConfig;
use crate::flow::{AddressFamily, Flow};
use crate::ipfix::{self, FieldMap, OptionsTemplateRecord, PacketHeader};
use crate::packet::{self, DecodeError};
use crate::sflow::{self, Sample};
use crate::srcache::SamplerateCache;
use crate::stats::Stats;
use crate::templates::{TemplateCache, TemplateKey};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Per-worker receive buffer size; larger than any sane export datagram.
pub const RECV_BUFFER_SIZE: usize = 8960;

/// A running collector: socket plus reader pool. `close` cancels the
/// workers and waits for them to exit; the output channel stays open so
/// downstream consumers can drain before the enclosing service stops them.
pub struct Collector {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Collector {
    pub async fn spawn_ipfix(
        listener: &ListenerConfig,
        agents: HashMap<IpAddr, String>,
        templates: Arc<TemplateCache>,
        samplerates: Arc<SamplerateCache>,
        stats: Arc<Stats>,
        bgp_augmentation: bool,
        output: mpsc::Sender<Flow>,
    ) -> Result<Self> {
        let socket = bind(listener).await?;
        let local_addr = socket.local_addr().context("ipfix local addr")?;
        let context = Arc::new(IpfixContext {
            agents,
            templates,
            samplerates,
            stats,
            bgp_augmentation,
        });

        let shutdown = CancellationToken::new();
        let mut workers = Vec::with_capacity(listener.readers);
        for worker in 0..listener.readers {
            let socket = Arc::clone(&socket);
            let context = Arc::clone(&context);
            let output = output.clone();
            let shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                ipfix_worker(worker, socket, context, output, shutdown).await;
            }));
        }

        tracing::info!(listen = %local_addr, readers = listener.readers, "ipfix collector up");
        Ok(Self {
            local_addr,
            shutdown,
            workers,
        })
    }

    pub async fn spawn_sflow(
        listener: &ListenerConfig,
        agents: HashMap<IpAddr, String>,
        samplerates: Arc<SamplerateCache>,
        stats: Arc<Stats>,
        output: mpsc::Sender<Flow>,
    ) -> Result<Self> {
        let socket = bind(listener).await?;
        let local_addr = socket.local_addr().context("sflow local addr")?;
        let context = Arc::new(SflowContext {
            agents,
            samplerates,
            stats,
        });

        let shutdown = CancellationToken::new();
        let mut workers = Vec::with_capacity(listener.readers);
        for worker in 0..listener.readers {
            let socket = Arc::clone(&socket);
            let context = Arc::clone(&context);
            let output = output.clone();
            let shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                sflow_worker(worker, socket, context, output, shutdown).await;
            }));
        }

        tracing::info!(listen = %local_addr, readers = listener.readers, "sflow collector up");
        Ok(Self {
            local_addr,
            shutdown,
            workers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn close(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn bind(listener: &ListenerConfig) -> Result<Arc<UdpSocket>> {
    let addr = listener.listen_addr()?;
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    Ok(Arc::new(socket))
}

struct IpfixContext {
    agents: HashMap<IpAddr, String>,
    templates: Arc<TemplateCache>,
    samplerates: Arc<SamplerateCache>,
    stats: Arc<Stats>,
    bgp_augmentation: bool,
}

struct SflowContext {
    agents: HashMap<IpAddr, String>,
    samplerates: Arc<SamplerateCache>,
    stats: Arc<Stats>,
}

async fn ipfix_worker(
    worker: usize,
    socket: Arc<UdpSocket>,
    context: Arc<IpfixContext>,
    output: mpsc::Sender<Flow>,
    shutdown: CancellationToken,
) {
    let mut buffer = vec![0_u8; RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            recv = socket.recv_from(&mut buffer) => {
                let (received, peer) = match recv {
                    Ok(result) => result,
                    Err(err) => {
                        tracing::warn!(worker, "ipfix recv error: {err}");
                        continue;
                    }
                };

                context.stats.ipfix_packets.fetch_add(1, Ordering::Relaxed);
                context
                    .stats
                    .ipfix_bytes
                    .fetch_add(received as u64, Ordering::Relaxed);

                if !context.agents.contains_key(&peer.ip()) {
                    context.stats.unknown_sources.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(source = %peer.ip(), "dropping ipfix datagram from unknown source");
                    continue;
                }

                if process_ipfix_datagram(&context, peer.ip(), &buffer[..received], &output)
                    .await
                    .is_err()
                {
                    // downstream closed its receiver; nothing left to feed
                    break;
                }
            }
        }
    }
    tracing::debug!(worker, "ipfix reader exiting");
}

async fn sflow_worker(
    worker: usize,
    socket: Arc<UdpSocket>,
    context: Arc<SflowContext>,
    output: mpsc::Sender<Flow>,
    shutdown: CancellationToken,
) {
    let mut buffer = vec![0_u8; RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            recv = socket.recv_from(&mut buffer) => {
                let (received, peer) = match recv {
                    Ok(result) => result,
                    Err(err) => {
                        tracing::warn!(worker, "sflow recv error: {err}");
                        continue;
                    }
                };

                context.stats.sflow_packets.fetch_add(1, Ordering::Relaxed);
                context
                    .stats
                    .sflow_bytes
                    .fetch_add(received as u64, Ordering::Relaxed);

                if !context.agents.contains_key(&peer.ip()) {
                    context.stats.unknown_sources.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(source = %peer.ip(), "dropping sflow datagram from unknown source");
                    continue;
                }

                if process_sflow_datagram(&context, peer.ip(), &buffer[..received], &output)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
    tracing::debug!(worker, "sflow reader exiting");
}

/// Channel-closed marker; the only condition that stops a worker besides
/// cancellation.
struct OutputClosed;

async fn process_ipfix_datagram(
    context: &IpfixContext,
    agent: IpAddr,
    payload: &[u8],
    output: &mpsc::Sender<Flow>,
) -> Result<(), OutputClosed> {
    let header = match ipfix::decode_header(payload) {
        Ok((header, _)) => header,
        Err(err) => {
            context.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%agent, "ipfix header decode failed: {err}");
            return Ok(());
        }
    };

    let sets = match ipfix::decode_sets(payload, &header) {
        Ok(sets) => sets,
        Err(err) => {
            context.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%agent, "ipfix set iteration failed: {err}");
            return Ok(());
        }
    };

    for set in sets {
        match set.id {
            ipfix::SET_TEMPLATE => match ipfix::decode_template_set(set.body) {
                Ok(records) => {
                    for record in records {
                        let key = TemplateKey {
                            agent,
                            domain_id: header.domain_id,
                            template_id: record.template_id,
                        };
                        context.templates.set(key, record);
                    }
                }
                Err(err) => {
                    context.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%agent, "ipfix template set decode failed: {err}");
                }
            },
            ipfix::SET_OPTIONS_TEMPLATE => match ipfix::decode_options_template_set(set.body) {
                Ok(records) => {
                    for record in records {
                        let key = TemplateKey {
                            agent,
                            domain_id: header.domain_id,
                            template_id: record.template_id,
                        };
                        context.templates.set_options(key, record);
                    }
                }
                Err(err) => {
                    context.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%agent, "ipfix options template decode failed: {err}");
                }
            },
            id if id >= ipfix::SET_DATA_MIN => {
                process_ipfix_data_set(context, agent, &header, id, set.body, output).await?;
            }
            other => {
                tracing::debug!(%agent, set_id = other, "ignoring reserved ipfix set");
            }
        }
    }

    Ok(())
}

async fn process_ipfix_data_set(
    context: &IpfixContext,
    agent: IpAddr,
    header: &PacketHeader,
    set_id: u16,
    body: &[u8],
    output: &mpsc::Sender<Flow>,
) -> Result<(), OutputClosed> {
    let key = TemplateKey {
        agent,
        domain_id: header.domain_id,
        template_id: set_id,
    };

    if let Some(options) = context.templates.get_options(&key) {
        apply_options_records(context, agent, &options, body);
        return Ok(());
    }

    let Some(template) = context.templates.get(&key) else {
        // templates may lag behind data in the export stream
        context.stats.template_misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            %agent,
            domain_id = header.domain_id,
            template_id = set_id,
            "template for data set not yet seen, dropping"
        );
        return Ok(());
    };

    let records = match ipfix::split_records(&template.fields, body) {
        Ok(records) => records,
        Err(err) => {
            context.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%agent, template_id = set_id, "ipfix record split failed: {err}");
            return Ok(());
        }
    };

    let map = FieldMap::from_fields(&template.fields);
    for values in records {
        let Some(flow) = flow_from_record(context, agent, header, &map, &values) else {
            continue;
        };
        count_flow(&context.stats, flow.family);
        if output.send(flow).await.is_err() {
            return Err(OutputClosed);
        }
    }

    Ok(())
}

fn apply_options_records(
    context: &IpfixContext,
    agent: IpAddr,
    options: &OptionsTemplateRecord,
    body: &[u8],
) {
    let interval_idx = options.fields.iter().position(|field| {
        field.enterprise.is_none() && field.id == ipfix::ie::SAMPLING_PACKET_INTERVAL
    });
    let Some(interval_idx) = interval_idx else {
        return;
    };

    let records = match ipfix::split_records(&options.fields, body) {
        Ok(records) => records,
        Err(err) => {
            context.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%agent, "ipfix options data split failed: {err}");
            return;
        }
    };

    for values in records {
        let rate = ipfix::be_uint(values[interval_idx]);
        if rate > 0 {
            context.samplerates.set(agent, rate);
            tracing::debug!(%agent, rate, "samplerate updated from options record");
        }
    }
}

fn flow_from_record(
    context: &IpfixContext,
    agent: IpAddr,
    header: &PacketHeader,
    map: &FieldMap,
    values: &[&[u8]],
) -> Option<Flow> {
    let Some(family) = map.family else {
        tracing::debug!(%agent, "template carries no address family, dropping record");
        return None;
    };

    let src_addr = ip_field(values, map.src_addr)?;
    let dst_addr = ip_field(values, map.dst_addr)?;
    if AddressFamily::of(src_addr) != family || AddressFamily::of(dst_addr) != family {
        context.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(%agent, "record addresses disagree with template family, dropping");
        return None;
    }

    let mut flow = Flow {
        family,
        src_addr,
        dst_addr,
        router: agent,
        timestamp: i64::from(header.export_time),
        samplerate: context.samplerates.get(agent),
        ..Default::default()
    };

    if let Some(idx) = map.protocol {
        flow.protocol = ipfix::be_uint(values[idx]) as u8;
    }
    if let Some(idx) = map.packets {
        flow.packets = ipfix::be_uint(values[idx]);
    }
    if let Some(idx) = map.size {
        flow.size = ipfix::be_uint(values[idx]);
    }
    if let Some(idx) = map.int_in {
        flow.int_in = ipfix::be_uint(values[idx]) as u32;
    }
    if let Some(idx) = map.int_out {
        flow.int_out = ipfix::be_uint(values[idx]) as u32;
    }
    if let Some(idx) = map.src_port {
        flow.src_port = ipfix::be_uint(values[idx]) as u16;
    }
    if let Some(idx) = map.dst_port {
        flow.dst_port = ipfix::be_uint(values[idx]) as u16;
    }
    if let Some(idx) = map.next_hop {
        flow.next_hop = ip_from_bytes(values[idx]);
    }

    // exporter ASNs are only trusted when BGP augmentation will not
    // overwrite them anyway
    if !context.bgp_augmentation {
        if let Some(idx) = map.src_as {
            flow.src_as = ipfix::be_uint(values[idx]) as u32;
        }
        if let Some(idx) = map.dst_as {
            flow.dst_as = ipfix::be_uint(values[idx]) as u32;
        }
    }

    Some(flow)
}

fn ip_field(values: &[&[u8]], idx: Option<usize>) -> Option<IpAddr> {
    ip_from_bytes(values[idx?])
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let mut octets = [0_u8; 4];
            octets.copy_from_slice(bytes);
            Some(IpAddr::from(octets))
        }
        16 => {
            let mut octets = [0_u8; 16];
            octets.copy_from_slice(bytes);
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

async fn process_sflow_datagram(
    context: &SflowContext,
    agent: IpAddr,
    payload: &[u8],
    output: &mpsc::Sender<Flow>,
) -> Result<(), OutputClosed> {
    let datagram = match sflow::decode_datagram(payload) {
        Ok(datagram) => datagram,
        Err(err) => {
            context.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%agent, "sflow decode failed: {err}");
            return Ok(());
        }
    };

    for sample in datagram.samples {
        let sample = match sample {
            Sample::Flow(sample) => sample,
            Sample::Skipped { format } => {
                tracing::trace!(%agent, format, "skipping sflow sample format");
                continue;
            }
        };

        let Some(raw) = sample.raw_header else {
            tracing::info!(%agent, "flow sample without raw packet header, skipped");
            continue;
        };
        if raw.header_protocol != sflow::HEADER_PROTO_ETHERNET {
            tracing::info!(
                %agent,
                header_protocol = raw.header_protocol,
                "unsupported sflow header protocol, skipped"
            );
            continue;
        }

        // the rate ships in-band with every sample
        context
            .samplerates
            .set(agent, u64::from(sample.sampling_rate));

        let frame = match packet::decode_sampled_frame(raw.header) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(err @ DecodeError::UnsupportedEtherType(_)) => {
                context.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%agent, "{err}, sample dropped");
                continue;
            }
            Err(err) => {
                context.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%agent, "sampled header decode failed: {err}");
                continue;
            }
        };

        let flow = Flow {
            family: AddressFamily::of(frame.src_addr),
            src_addr: frame.src_addr,
            dst_addr: frame.dst_addr,
            protocol: frame.protocol,
            src_port: frame.src_port,
            dst_port: frame.dst_port,
            router: agent,
            next_hop: sample.extended_router.map(|router| router.next_hop),
            int_in: sample.input_if,
            int_out: sample.output_if,
            samplerate: u64::from(sample.sampling_rate),
            packets: 1,
            size: u64::from(raw.frame_length),
            timestamp: chrono::Utc::now().timestamp(),
            ..Default::default()
        };

        count_flow(&context.stats, flow.family);
        if output.send(flow).await.is_err() {
            return Err(OutputClosed);
        }
    }

    Ok(())
}

fn count_flow(stats: &Stats, family: AddressFamily) {
    match family {
        AddressFamily::Ipv4 => stats.flows4.fetch_add(1, Ordering::Relaxed),
        AddressFamily::Ipv6 => stats.flows6.fetch_add(1, Ordering::Relaxed),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipfix::testutil as ipfix_build;
    use crate::ipfix::{ie, SET_OPTIONS_TEMPLATE, SET_TEMPLATE};
    use crate::sflow::testutil::{build_datagram, FlowSampleSpec};
    use std::net::Ipv6Addr;
    use std::time::Duration;
    use tokio::time::timeout;

    const LOCALHOST: &str = "127.0.0.1";

    fn localhost_agents() -> HashMap<IpAddr, String> {
        HashMap::from([(LOCALHOST.parse().unwrap(), "test-agent".to_string())])
    }

    fn test_listener() -> ListenerConfig {
        serde_yaml::from_str("listen: \"127.0.0.1:0\"\nreaders: 1\n").unwrap()
    }

    async fn recv_flow(rx: &mut mpsc::Receiver<Flow>) -> Flow {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for flow")
            .expect("flow channel closed")
    }

    fn ethernet_ipv4_tcp() -> Vec<u8> {
        let mut frame = vec![0_u8; 12];
        frame.extend_from_slice(&packet::ETHERTYPE_IPV4.to_be_bytes());
        let mut ip = vec![0x45, 0, 0, 40, 0, 0, 0, 0, 64, packet::PROTO_TCP, 0, 0];
        ip.extend_from_slice(&[10, 0, 0, 1]);
        ip.extend_from_slice(&[10, 0, 0, 2]);
        ip.extend_from_slice(&443_u16.to_be_bytes());
        ip.extend_from_slice(&51234_u16.to_be_bytes());
        ip.extend_from_slice(&[0_u8; 16]);
        frame.extend_from_slice(&ip);
        frame
    }

    #[tokio::test]
    async fn sflow_sample_becomes_normalized_flow() {
        let stats = Arc::new(Stats::default());
        let samplerates = Arc::new(SamplerateCache::default());
        let (tx, mut rx) = mpsc::channel(16);

        let collector = Collector::spawn_sflow(
            &test_listener(),
            localhost_agents(),
            Arc::clone(&samplerates),
            Arc::clone(&stats),
            tx,
        )
        .await
        .unwrap();

        let header = ethernet_ipv4_tcp();
        let payload = build_datagram(
            LOCALHOST.parse().unwrap(),
            &[FlowSampleSpec {
                sampling_rate: 1024,
                input_if: 1,
                output_if: 2,
                frame_length: 1500,
                header: &header,
                next_hop: Some("10.0.0.254".parse().unwrap()),
            }],
        );

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&payload, collector.local_addr())
            .await
            .unwrap();

        let flow = recv_flow(&mut rx).await;
        assert_eq!(flow.src_addr, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(flow.dst_addr, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(flow.src_port, 443);
        assert_eq!(flow.dst_port, 51234);
        assert_eq!(flow.protocol, 6);
        assert_eq!(flow.size, 1500);
        assert_eq!(flow.packets, 1);
        assert_eq!(flow.samplerate, 1024);
        assert_eq!(flow.int_in, 1);
        assert_eq!(flow.int_out, 2);
        assert_eq!(flow.next_hop, Some("10.0.0.254".parse::<IpAddr>().unwrap()));
        assert_eq!(flow.router, LOCALHOST.parse::<IpAddr>().unwrap());

        // the in-band rate landed in the cache
        assert_eq!(samplerates.get(LOCALHOST.parse().unwrap()), 1024);
        assert_eq!(stats.sflow_packets.load(Ordering::Relaxed), 1);
        assert_eq!(stats.flows4.load(Ordering::Relaxed), 1);

        collector.close().await;
    }

    #[tokio::test]
    async fn ipfix_ipv6_template_and_data() {
        let stats = Arc::new(Stats::default());
        let templates = Arc::new(TemplateCache::new());
        let samplerates = Arc::new(SamplerateCache::default());
        let (tx, mut rx) = mpsc::channel(16);

        let collector = Collector::spawn_ipfix(
            &test_listener(),
            localhost_agents(),
            Arc::clone(&templates),
            samplerates,
            Arc::clone(&stats),
            false,
            tx,
        )
        .await
        .unwrap();

        let template_set = ipfix_build::build_template_set(
            256,
            &[
                (ie::IPV6_SRC_ADDR, 16),
                (ie::IPV6_DST_ADDR, 16),
                (ie::PROTOCOL_IDENTIFIER, 1),
                (ie::OCTET_DELTA_COUNT, 4),
                (ie::L4_SRC_PORT, 2),
                (ie::L4_DST_PORT, 2),
            ],
        );

        let mut record = Vec::new();
        record.extend_from_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        record.extend_from_slice(&"2001:db8::2".parse::<Ipv6Addr>().unwrap().octets());
        record.push(17);
        record.extend_from_slice(&2048_u32.to_be_bytes());
        record.extend_from_slice(&53_u16.to_be_bytes());
        record.extend_from_slice(&33333_u16.to_be_bytes());

        let message = ipfix_build::build_message(
            9,
            1_700_000_000,
            &[(SET_TEMPLATE, template_set), (256, record)],
        );

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&message, collector.local_addr())
            .await
            .unwrap();

        let flow = recv_flow(&mut rx).await;
        assert_eq!(flow.family, AddressFamily::Ipv6);
        assert_eq!(flow.src_addr, "2001:db8::1".parse::<IpAddr>().unwrap());
        assert_eq!(flow.dst_addr, "2001:db8::2".parse::<IpAddr>().unwrap());
        assert_eq!(flow.protocol, 17);
        assert_eq!(flow.size, 2048);
        assert_eq!(flow.src_port, 53);
        assert_eq!(flow.dst_port, 33333);
        assert_eq!(flow.timestamp, 1_700_000_000);
        assert_eq!(flow.samplerate, 1); // nothing cached for this agent
        assert_eq!(stats.flows6.load(Ordering::Relaxed), 1);

        collector.close().await;
    }

    #[tokio::test]
    async fn ipfix_data_before_template_is_dropped_then_decodes() {
        let stats = Arc::new(Stats::default());
        let templates = Arc::new(TemplateCache::new());
        let (tx, mut rx) = mpsc::channel(16);

        let collector = Collector::spawn_ipfix(
            &test_listener(),
            localhost_agents(),
            Arc::clone(&templates),
            Arc::new(SamplerateCache::default()),
            Arc::clone(&stats),
            false,
            tx,
        )
        .await
        .unwrap();

        let mut record = Vec::new();
        record.extend_from_slice(&[10, 1, 1, 1]);
        record.extend_from_slice(&[10, 1, 1, 2]);
        record.push(6);
        record.extend_from_slice(&900_u32.to_be_bytes());

        let fields = [
            (ie::IPV4_SRC_ADDR, 4_u16),
            (ie::IPV4_DST_ADDR, 4),
            (ie::PROTOCOL_IDENTIFIER, 1),
            (ie::OCTET_DELTA_COUNT, 4),
        ];

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // data first: no template yet, dropped silently
        let orphan = ipfix_build::build_message(3, 100, &[(256, record.clone())]);
        sender
            .send_to(&orphan, collector.local_addr())
            .await
            .unwrap();

        // then template, then matching data
        let template_msg = ipfix_build::build_message(
            3,
            101,
            &[(SET_TEMPLATE, ipfix_build::build_template_set(256, &fields))],
        );
        sender
            .send_to(&template_msg, collector.local_addr())
            .await
            .unwrap();
        let data_msg = ipfix_build::build_message(3, 102, &[(256, record)]);
        sender
            .send_to(&data_msg, collector.local_addr())
            .await
            .unwrap();

        let flow = recv_flow(&mut rx).await;
        assert_eq!(flow.src_addr, "10.1.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(flow.size, 900);
        assert_eq!(flow.timestamp, 102);

        // the orphan counted as a miss and produced nothing
        assert_eq!(stats.template_misses.load(Ordering::Relaxed), 1);
        assert_eq!(stats.flows4.load(Ordering::Relaxed), 1);

        collector.close().await;
    }

    #[tokio::test]
    async fn ipfix_options_record_updates_samplerate() {
        let stats = Arc::new(Stats::default());
        let templates = Arc::new(TemplateCache::new());
        let samplerates = Arc::new(SamplerateCache::default());
        let (tx, mut rx) = mpsc::channel(16);

        let collector = Collector::spawn_ipfix(
            &test_listener(),
            localhost_agents(),
            templates,
            Arc::clone(&samplerates),
            stats,
            false,
            tx,
        )
        .await
        .unwrap();

        let options_template =
            ipfix_build::build_options_template_set(512, 0, &[(ie::SAMPLING_PACKET_INTERVAL, 4)]);
        let options_data = 2048_u32.to_be_bytes().to_vec();
        let message = ipfix_build::build_message(
            3,
            100,
            &[
                (SET_OPTIONS_TEMPLATE, options_template),
                (512, options_data),
            ],
        );

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&message, collector.local_addr())
            .await
            .unwrap();

        // poll until the worker has applied the rate from the options record
        let agent: IpAddr = LOCALHOST.parse().unwrap();
        timeout(Duration::from_secs(5), async {
            loop {
                if samplerates.get(agent) == 2048 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("samplerate update never arrived");

        assert!(rx.try_recv().is_err()); // options data is not a flow
        collector.close().await;
    }

    #[tokio::test]
    async fn unknown_source_is_counted_and_dropped() {
        let stats = Arc::new(Stats::default());
        let samplerates = Arc::new(SamplerateCache::default());
        let (tx, mut rx) = mpsc::channel(16);

        // only 192.0.2.1 is configured; our localhost sender is unknown
        let agents = HashMap::from([("192.0.2.1".parse::<IpAddr>().unwrap(), "far".to_string())]);
        let collector =
            Collector::spawn_sflow(&test_listener(), agents, samplerates, Arc::clone(&stats), tx)
                .await
                .unwrap();

        let header = ethernet_ipv4_tcp();
        let payload = build_datagram(
            "192.0.2.99".parse().unwrap(),
            &[FlowSampleSpec {
                sampling_rate: 64,
                input_if: 1,
                output_if: 2,
                frame_length: 100,
                header: &header,
                next_hop: None,
            }],
        );

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&payload, collector.local_addr())
            .await
            .unwrap();

        timeout(Duration::from_secs(5), async {
            loop {
                if stats.unknown_sources.load(Ordering::Relaxed) == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("unknown source was never counted");

        assert!(rx.try_recv().is_err());
        assert_eq!(stats.flows4.load(Ordering::Relaxed), 0);

        collector.close().await;
    }

    #[tokio::test]
    async fn exporter_asns_ignored_when_augmentation_enabled() {
        let stats = Arc::new(Stats::default());
        let (tx, mut rx) = mpsc::channel(16);

        let collector = Collector::spawn_ipfix(
            &test_listener(),
            localhost_agents(),
            Arc::new(TemplateCache::new()),
            Arc::new(SamplerateCache::default()),
            stats,
            true,
            tx,
        )
        .await
        .unwrap();

        let fields = [
            (ie::IPV4_SRC_ADDR, 4_u16),
            (ie::IPV4_DST_ADDR, 4),
            (ie::BGP_SOURCE_AS, 4),
            (ie::BGP_DESTINATION_AS, 4),
        ];
        let mut record = Vec::new();
        record.extend_from_slice(&[10, 1, 1, 1]);
        record.extend_from_slice(&[10, 1, 1, 2]);
        record.extend_from_slice(&64500_u32.to_be_bytes());
        record.extend_from_slice(&64501_u32.to_be_bytes());

        let message = ipfix_build::build_message(
            3,
            100,
            &[
                (SET_TEMPLATE, ipfix_build::build_template_set(256, &fields)),
                (256, record),
            ],
        );

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&message, collector.local_addr())
            .await
            .unwrap();

        let flow = recv_flow(&mut rx).await;
        // the annotator owns ASNs in augmented mode
        assert_eq!(flow.src_as, 0);
        assert_eq!(flow.dst_as, 0);

        collector.close().await;
    }

    #[tokio::test]
    async fn close_joins_all_workers() {
        let (tx, _rx) = mpsc::channel(1);
        let listener: ListenerConfig =
            serde_yaml::from_str("listen: \"127.0.0.1:0\"\nreaders: 3\n").unwrap();
        let collector = Collector::spawn_sflow(
            &listener,
            localhost_agents(),
            Arc::new(SamplerateCache::default()),
            Arc::new(Stats::default()),
            tx,
        )
        .await
        .unwrap();

        timeout(Duration::from_secs(5), collector.close())
            .await
            .expect("close did not join workers in time");
    }
}
