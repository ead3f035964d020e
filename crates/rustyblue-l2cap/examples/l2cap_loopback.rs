/// Example wiring two L2CAP nodes back to back over an in-memory link
use rustyblue_l2cap::l2cap::constants::L2CAP_INFO_EXTENDED_FEATURES;
use rustyblue_l2cap::l2cap::*;
use rustyblue_l2cap::*;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const HANDLE: u16 = 0x0001;

/// What travels over the simulated wire
enum Frame {
    LinkRequest { from: usize },
    LinkAccepted { from: usize },
    LinkDown { from: usize },
    Pdu { to: usize, bytes: Vec<u8> },
}

type Wire = Arc<Mutex<VecDeque<Frame>>>;

/// One end of the simulated link
struct LoopbackLink {
    side: usize,
    wire: Wire,
}

impl LoopbackLink {
    fn push(&self, frame: Frame) {
        self.wire.lock().unwrap().push_back(frame);
    }
}

impl LowerLayer for LoopbackLink {
    fn open_connection(&self, _peer: BdAddr) -> Result<(), LinkError> {
        self.push(Frame::LinkRequest { from: self.side });
        Ok(())
    }

    fn accept_connection(&self, _peer: BdAddr) -> Result<(), LinkError> {
        self.push(Frame::LinkAccepted { from: self.side });
        Ok(())
    }

    fn close_connection(&self, _handle: u16) -> Result<(), LinkError> {
        self.push(Frame::LinkDown { from: self.side });
        Ok(())
    }

    fn send_pdu(&self, _handle: u16, pdu: &[u8]) -> Result<(), LinkError> {
        self.push(Frame::Pdu {
            to: 1 - self.side,
            bytes: pdu.to_vec(),
        });
        Ok(())
    }
}

/// Deliver everything on the wire until it is quiet
fn pump(wire: &Wire, nodes: &[L2capManager; 2], addrs: &[BdAddr; 2]) {
    loop {
        let Some(frame) = wire.lock().unwrap().pop_front() else {
            return;
        };

        match frame {
            Frame::LinkRequest { from } => nodes[1 - from].on_lower_connection_indication(addrs[from]),
            Frame::LinkAccepted { from } => {
                nodes[from].on_lower_connected(addrs[1 - from], HANDLE);
                nodes[1 - from].on_lower_connected(addrs[from], HANDLE);
            }
            Frame::LinkDown { from } => nodes[1 - from].on_lower_disconnected(HANDLE, 0x13),
            Frame::Pdu { to, bytes } => nodes[to].on_lower_pdu_received(HANDLE, &bytes),
        }
    }
}

fn printer(name: &'static str) -> ChannelEventCallback {
    Arc::new(Mutex::new(move |event: ChannelEvent| -> L2capResult<()> {
        match event {
            ChannelEvent::Connected { cid, psm } => {
                println!("[{}] Channel connected: CID=0x{:04X}, PSM={}", name, cid, psm);
            }
            ChannelEvent::Disconnected { cid, psm, reason } => {
                println!(
                    "[{}] Channel disconnected: CID=0x{:04X}, PSM={}, Reason={}",
                    name, cid, psm, reason
                );
            }
            ChannelEvent::Data { cid, data } => {
                println!(
                    "[{}] Received on 0x{:04X}: {}",
                    name,
                    cid,
                    String::from_utf8_lossy(&data)
                );
            }
            ChannelEvent::EchoResponse { token, data } => {
                println!("[{}] Echo #{} answered with {} bytes", name, token, data.len());
            }
            ChannelEvent::InfoResponse { token, data, .. } => {
                println!("[{}] Info #{}: {}", name, token, hex::encode(data));
            }
            other => println!("[{}] Other channel event: {:?}", name, other),
        }
        Ok(())
    }))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("L2CAP Loopback Example");
    println!("----------------------");

    let wire: Wire = Arc::new(Mutex::new(VecDeque::new()));
    let addrs: [BdAddr; 2] = ["00:11:22:33:44:55".parse()?, "66:77:88:99:AA:BB".parse()?];

    let config = L2capConfig::default().with_auto_configure(true);
    let nodes = [
        L2capManager::new(
            config.clone(),
            Arc::new(LoopbackLink {
                side: 0,
                wire: wire.clone(),
            }),
        )?,
        L2capManager::new(
            config,
            Arc::new(LoopbackLink {
                side: 1,
                wire: wire.clone(),
            }),
        )?,
    ];

    nodes[0].register_psm(PSM::SDP, Some(printer("client")), ConnectionPolicy::default())?;
    nodes[1].register_psm(
        PSM::SDP,
        Some(printer("server")),
        ConnectionPolicy { auto_accept: true },
    )?;

    println!("Opening SDP channel from {} to {}", addrs[0], addrs[1]);
    let cid = nodes[0].channel_open_request(PSM::SDP, addrs[1])?;
    pump(&wire, &nodes, &addrs);

    if let Some(info) = nodes[0].channel_info(cid) {
        println!(
            "Channel 0x{:04X} -> 0x{:04X}, MTU in/out {}/{}",
            info.local_cid, info.remote_cid, info.incoming_mtu, info.outgoing_mtu
        );
    }

    nodes[0].channel_send(cid, b"hello over L2CAP")?;
    nodes[0].ping(addrs[1], b"ping", 1)?;
    nodes[0].get_info(addrs[1], L2CAP_INFO_EXTENDED_FEATURES, 2)?;
    pump(&wire, &nodes, &addrs);

    println!("Closing channel 0x{:04X}", cid);
    nodes[0].channel_close(cid)?;
    pump(&wire, &nodes, &addrs);

    println!(
        "Connections left: client={}, server={}",
        nodes[0].connection_count(),
        nodes[1].connection_count()
    );
    println!("Example completed successfully.");
    Ok(())
}
