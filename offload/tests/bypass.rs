// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use capability::{CapabilitySet, Layer, LayerFlags};
use etherparse::PacketBuilder;
use flow_state::{BypassState, Transition};
use flowbypass_offload::{
    AssistantConfig, Backpressure, BypassError, Device, DeviceConfig, DeviceError, DeviceSetup,
    Verdict,
};
use iface::{CopyMode, IfaceConfig, IfaceError, IfaceParams, Released};
use pkt_meta::{FlowKey, RuleList};
use tracing_test::traced_test;

const CLIENT: [u8; 4] = [10, 0, 0, 1];
const SERVER: [u8; 4] = [10, 0, 0, 2];

fn frame(src_port: u16, reply: bool) -> Vec<u8> {
    let (src, dst, sport, dport) = if reply {
        (SERVER, CLIENT, 443, src_port)
    } else {
        (CLIENT, SERVER, src_port, 443)
    };
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4(src, dst, 64)
        .tcp(sport, dport, 1, 8192);
    let payload = b"payload";
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).unwrap();
    frame
}

fn key(src_port: u16) -> FlowKey {
    FlowKey::new(
        Ipv4Addr::from(CLIENT).into(),
        Ipv4Addr::from(SERVER).into(),
        src_port,
        443,
        6,
    )
}

struct Sizing {
    queues: u16,
    ring: usize,
    pool: usize,
    cache: usize,
    capacity: usize,
}

impl Default for Sizing {
    fn default() -> Self {
        Self {
            queues: 1,
            ring: 16,
            pool: 32,
            cache: 0,
            capacity: 64,
        }
    }
}

fn device(sizing: &Sizing) -> (Device, Arc<AtomicUsize>) {
    let mut params = IfaceParams::new("eth0");
    params.rx_queues = sizing.queues;
    params.threads = sizing.queues;
    params.link.ring_size = sizing.ring;
    params.link.pool_size = sizing.pool;
    params.link.cache_size = sizing.cache;
    let setup = DeviceSetup {
        params,
        requested: CapabilitySet::new().with(Layer::Ipv4, LayerFlags::MATCH),
        supported: CapabilitySet::new().with(Layer::Ipv4, LayerFlags::MATCH),
        assistant: AssistantConfig {
            capacity: sizing.capacity,
            observed: 1024,
        },
        available_cores: sizing.queues,
    };
    let torn = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&torn);
    let device = Device::setup(setup, move |_: &IfaceConfig| {
        seen.fetch_add(1, Ordering::AcqRel);
    })
    .unwrap();
    (device, torn)
}

#[test]
#[traced_test]
fn prevention_mode_excludes_layers_without_support() {
    let mut params = IfaceParams::new("eth0");
    params.copy_mode = CopyMode::Ips;
    params.out_iface = Some("eth1".to_string());
    let setup = DeviceSetup {
        params,
        requested: CapabilitySet::new()
            .with(Layer::Ipv4, LayerFlags::MATCH)
            .with(Layer::Tcp, LayerFlags::MATCH),
        supported: CapabilitySet::new()
            .with(Layer::Ipv4, LayerFlags::MATCH | LayerFlags::DROP),
        assistant: AssistantConfig::default(),
        available_cores: 1,
    };
    let device = Device::setup(setup, |_: &IfaceConfig| {}).unwrap();
    let offloads = device.offloads().unwrap();
    let negotiated = offloads.negotiation.negotiated;
    assert_eq!(negotiated.flags(Layer::Ipv4), LayerFlags::MATCH);
    assert!(negotiated.flags(Layer::Tcp).is_empty());
    assert_eq!(offloads.active.flags(Layer::Ipv4), LayerFlags::MATCH);
    assert!(offloads.active.flags(Layer::Tcp).is_empty());
    assert!(offloads.negotiation.report(Layer::Tcp).narrowed());
}

#[test]
#[traced_test]
fn silence_means_bypassed_until_soft_delete() {
    let (device, _) = device(&Sizing::default());
    let mut worker = device.attach_worker().unwrap();
    let mut assistant = device.assistant(worker.queue()).unwrap();
    let k = key(40000);

    assert!(matches!(assistant.ingest(&frame(40000, false)), Verdict::ToEngine(_)));
    let mut rules = RuleList::new();
    rules.push(7).unwrap();
    assert_eq!(
        worker.offload_flow(&k, &rules),
        Ok(Transition::Moved {
            from: BypassState::Untracked,
            to: BypassState::Pending
        })
    );
    // the request was not handled yet
    assert_eq!(worker.poll().promoted, 0);
    assert_eq!(worker.state(&k), BypassState::Pending);

    assert_eq!(assistant.poll(), 1);
    assert!(assistant.is_installed(&k));
    assert_eq!(assistant.rule_ids(&k).unwrap().as_slice(), &[7]);

    let summary = worker.poll();
    assert_eq!((summary.received, summary.pending, summary.promoted), (0, 0, 1));
    assert!(worker.is_bypassed(&k));

    assert!(matches!(assistant.ingest(&frame(40000, false)), Verdict::Bypassed));
    assert!(matches!(assistant.ingest(&frame(40000, true)), Verdict::Bypassed));

    let t = worker.soft_delete(&k).unwrap();
    assert_eq!(t.state(), Some(BypassState::SoftDeleted));
    assert!(!worker.is_bypassed(&k));
    assistant.poll();
    assert!(matches!(assistant.ingest(&frame(40000, false)), Verdict::ToEngine(_)));
    // counters survive a soft delete
    assert_eq!(assistant.packets(&k), Some(3));

    // and a new ADD revives the rule
    worker.offload_flow(&k, &RuleList::new()).unwrap();
    assistant.poll();
    assert!(assistant.is_installed(&k));
}

#[test]
fn flow_not_found_reverts_pending() {
    let (device, _) = device(&Sizing::default());
    let mut worker = device.attach_worker().unwrap();
    let mut assistant = device.assistant(worker.queue()).unwrap();
    let k = key(40001);

    // never seen on the wire
    worker.offload_flow(&k, &RuleList::new()).unwrap();
    assert_eq!(worker.state(&k), BypassState::Pending);
    assistant.poll();
    assert_eq!(assistant.stats().not_found, 1);

    let summary = worker.poll();
    assert_eq!(summary.received, 1);
    assert_eq!(summary.promoted, 0);
    assert_eq!(worker.state(&k), BypassState::Untracked);
    for _ in 0..3 {
        worker.poll();
    }
    assert_eq!(worker.state(&k), BypassState::Untracked);
}

#[test]
fn exhausted_pool_recovers_once_messages_are_freed() {
    let (device, _) = device(&Sizing {
        ring: 8,
        pool: 4,
        ..Sizing::default()
    });
    let mut worker = device.attach_worker().unwrap();
    let mut assistant = device.assistant(worker.queue()).unwrap();
    for port in 1..=5 {
        assistant.ingest(&frame(port, false));
    }
    for port in 1..=4 {
        worker.offload_flow(&key(port), &RuleList::new()).unwrap();
    }
    for _ in 0..3 {
        assert_eq!(
            worker.offload_flow(&key(5), &RuleList::new()),
            Err(BypassError::Backpressure {
                kind: channel::MessageKind::Add,
                key: key(5),
                cause: Backpressure::Exhausted
            })
        );
    }
    // nothing was sent, nothing changed
    assert_eq!(worker.state(&key(5)), BypassState::Untracked);

    assert_eq!(assistant.poll(), 4);
    worker.offload_flow(&key(5), &RuleList::new()).unwrap();
}

#[test]
fn full_tasks_ring_is_backpressure() {
    let (device, _) = device(&Sizing {
        ring: 2,
        pool: 8,
        ..Sizing::default()
    });
    let mut worker = device.attach_worker().unwrap();
    worker.hard_delete(&key(1)).unwrap();
    worker.hard_delete(&key(2)).unwrap();
    let err = worker.hard_delete(&key(3)).unwrap_err();
    assert!(matches!(
        err,
        BypassError::Backpressure {
            cause: Backpressure::Full,
            ..
        }
    ));
    assert_eq!(worker.poll().pending, 2);
}

#[test]
#[traced_test]
fn full_rule_table_force_evicts_the_oldest_flow() {
    let (device, _) = device(&Sizing {
        capacity: 2,
        ..Sizing::default()
    });
    let mut worker = device.attach_worker().unwrap();
    let mut assistant = device.assistant(worker.queue()).unwrap();
    for port in 1..=3 {
        assistant.ingest(&frame(port, false));
    }
    for port in 1..=2 {
        worker.offload_flow(&key(port), &RuleList::new()).unwrap();
    }
    assistant.poll();
    worker.poll();
    worker.poll();
    assert!(worker.is_bypassed(&key(1)));

    worker.offload_flow(&key(3), &RuleList::new()).unwrap();
    assistant.poll();
    assert_eq!(assistant.installed(), 2);
    assert!(!assistant.is_installed(&key(1)));
    assert_eq!(assistant.stats().force_evicted, 1);

    worker.poll();
    assert_eq!(worker.state(&key(1)), BypassState::Evicted);
    assert!(!worker.is_bypassed(&key(1)));
    assert_eq!(worker.take_evicted(), vec![key(1)]);
    assert_eq!(worker.state(&key(1)), BypassState::Untracked);
}

#[test]
fn idle_rules_expire() {
    let (device, _) = device(&Sizing::default());
    let mut worker = device.attach_worker().unwrap();
    let mut assistant = device.assistant(worker.queue()).unwrap();
    assistant.ingest(&frame(9, false));
    worker.offload_flow(&key(9), &RuleList::new()).unwrap();
    assistant.poll();
    worker.poll();
    worker.poll();
    assert!(worker.is_bypassed(&key(9)));

    let idle = Duration::from_secs(30);
    assert_eq!(assistant.expire(Instant::now(), idle), 0);
    assert_eq!(assistant.expire(Instant::now() + 2 * idle, idle), 1);
    assert_eq!(assistant.installed(), 0);
    worker.poll();
    assert_eq!(worker.state(&key(9)), BypassState::Evicted);
    // HARD_DELETE of a flow that is already gone
    worker.hard_delete(&key(9)).unwrap();
    assistant.poll();
    assert_eq!(worker.poll().received, 0);
    assert_eq!(worker.state(&key(9)), BypassState::Untracked);
}

#[test]
fn replies_wait_in_the_backlog_when_the_results_ring_is_full() {
    let (device, _) = device(&Sizing {
        ring: 1,
        pool: 8,
        ..Sizing::default()
    });
    let mut worker = device.attach_worker().unwrap();
    let mut assistant = device.assistant(worker.queue()).unwrap();

    worker.offload_flow(&key(1), &RuleList::new()).unwrap();
    assistant.poll();
    worker.offload_flow(&key(2), &RuleList::new()).unwrap();
    assistant.poll();
    assert_eq!(assistant.backlog(), 1);

    worker.poll();
    assert_eq!(worker.state(&key(1)), BypassState::Untracked);
    assert_eq!(worker.state(&key(2)), BypassState::Pending);

    assistant.poll();
    assert_eq!(assistant.backlog(), 0);
    worker.poll();
    assert_eq!(worker.state(&key(2)), BypassState::Untracked);
}

#[test]
fn no_reply_is_lost_when_the_results_ring_stays_full() {
    const FLOWS: u16 = 34;
    let (device, _) = device(&Sizing {
        ring: 1,
        ..Sizing::default()
    });
    let mut worker = device.attach_worker().unwrap();
    let mut assistant = device.assistant(worker.queue()).unwrap();

    // none of these flows was seen on the wire
    for port in 0..FLOWS {
        while let Err(BypassError::Backpressure { .. }) =
            worker.offload_flow(&key(42000 + port), &RuleList::new())
        {
            worker.poll();
            assistant.poll();
        }
        assistant.poll();
    }
    assert!(assistant.stats().backlog_stalls > 0);
    for _ in 0..200 {
        worker.poll();
        assistant.poll();
    }

    for port in 0..FLOWS {
        assert_eq!(worker.state(&key(42000 + port)), BypassState::Untracked);
        assert!(!worker.is_bypassed(&key(42000 + port)));
    }
    assert_eq!(worker.counts().bypassed, 0);
    assert_eq!(assistant.installed(), 0);
    assert_eq!(assistant.stats().not_found, u64::from(FLOWS));
    assert_eq!(assistant.backlog(), 0);
}

#[test]
fn every_expiry_reaches_the_worker() {
    let (device, _) = device(&Sizing {
        ring: 1,
        ..Sizing::default()
    });
    let mut worker = device.attach_worker().unwrap();
    let mut assistant = device.assistant(worker.queue()).unwrap();
    for port in 1..=40 {
        assistant.ingest(&frame(port, false));
        worker.offload_flow(&key(port), &RuleList::new()).unwrap();
        assert_eq!(assistant.poll(), 1);
    }
    assert_eq!(worker.poll().promoted, 40);

    let idle = Duration::from_secs(30);
    assert_eq!(assistant.expire(Instant::now() + 2 * idle, idle), 40);
    for _ in 0..200 {
        worker.poll();
        assistant.poll();
    }
    assert_eq!(worker.take_evicted().len(), 40);
    assert_eq!(worker.counts().bypassed, 0);
}

#[test]
fn closing_the_device_keeps_work_of_attached_workers() {
    let (mut device, torn) = device(&Sizing {
        queues: 2,
        ..Sizing::default()
    });
    let mut worker = device.attach_worker().unwrap();
    let mut assistant = device.assistant(worker.queue()).unwrap();
    let k = key(41000);

    // unknown to the data path, so the ADD must come back as FLOW_NOT_FOUND
    worker.offload_flow(&k, &RuleList::new()).unwrap();
    assert_eq!(device.close(), Some(Released::Retained(1)));
    assert_eq!(assistant.poll(), 1);
    for _ in 0..3 {
        worker.poll();
    }
    assert_eq!(worker.state(&k), BypassState::Untracked);
    assert!(!worker.is_bypassed(&k));

    assert_eq!(torn.load(Ordering::Acquire), 0);
    drop(worker);
    assert_eq!(torn.load(Ordering::Acquire), 1);
}

#[test]
fn malformed_frames_are_reported() {
    let (device, _) = device(&Sizing::default());
    let mut assistant = device.assistant(iface::QueueId(0)).unwrap();
    assert!(matches!(assistant.ingest(&[0u8; 10]), Verdict::Malformed(_)));
    assert_eq!(assistant.stats().malformed, 1);
}

#[test]
#[traced_test]
fn close_is_idempotent_and_teardown_waits_for_workers() {
    let (mut device, torn) = device(&Sizing {
        queues: 2,
        ..Sizing::default()
    });
    let mut first = device.attach_worker().unwrap();
    let second = device.attach_worker().unwrap();
    assert_ne!(first.queue(), second.queue());
    assert!(matches!(
        device.attach_worker(),
        Err(DeviceError::Iface(IfaceError::QueuesExhausted { queues: 2, .. }))
    ));

    first.hard_delete(&key(1)).unwrap();
    assert_eq!(device.close(), Some(Released::Retained(2)));
    assert_eq!(device.close(), None);
    assert!(device.is_closed());
    assert!(matches!(device.attach_worker(), Err(DeviceError::Closed(_))));

    assert_eq!(first.close(), Some(Released::Retained(1)));
    assert_eq!(first.close(), None);
    assert_eq!(
        first.hard_delete(&key(1)),
        Err(BypassError::Closed(first.queue()))
    );
    assert_eq!(torn.load(Ordering::Acquire), 0);
    drop(second);
    assert_eq!(torn.load(Ordering::Acquire), 1);
}

#[test]
fn setup_from_yaml() {
    let yaml = r"
interface:
  name: eth3
  rx-queues: 2
requested:
  ipv4: match,checksum
supported:
  ipv4: match
";
    let setup = DeviceConfig::from_yaml_str(yaml).unwrap().into_setup(8);
    let device = Device::setup(setup, |_: &IfaceConfig| {}).unwrap();
    assert_eq!(device.name(), "eth3");
    assert_eq!(device.config().unwrap().threads(), 2);
    assert_eq!(
        device.offloads().unwrap().active.flags(Layer::Ipv4),
        LayerFlags::MATCH
    );
}

#[test]
fn worker_and_assistant_on_their_own_threads() {
    const FLOWS: u16 = 200;
    let (device, _) = device(&Sizing {
        ring: 8,
        pool: 16,
        cache: 4,
        capacity: 1024,
        ..Sizing::default()
    });
    let mut worker = device.attach_worker().unwrap();
    let mut assistant = device.assistant(worker.queue()).unwrap();
    for port in 0..FLOWS {
        assistant.ingest(&frame(port, false));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let stop_assistant = Arc::clone(&stop);
    let offload = std::thread::spawn(move || {
        while !stop_assistant.load(Ordering::Acquire) {
            if assistant.poll() == 0 {
                std::thread::yield_now();
            }
        }
        assistant
    });

    for port in 0..FLOWS {
        while let Err(BypassError::Backpressure { .. }) =
            worker.offload_flow(&key(port), &RuleList::new())
        {
            worker.poll();
            std::thread::yield_now();
        }
    }
    let deadline = Instant::now() + Duration::from_secs(30);
    while worker.counts().bypassed < usize::from(FLOWS) {
        assert!(Instant::now() < deadline, "flows never settled");
        worker.poll();
        std::thread::yield_now();
    }
    stop.store(true, Ordering::Release);
    let assistant = offload.join().unwrap();
    assert_eq!(assistant.installed(), usize::from(FLOWS));
    assert_eq!(assistant.stats().not_found, 0);
}
