//! Tests for the L2CAP implementation

#[cfg(test)]
mod tests {
    use super::super::command::*;
    use super::super::constants::*;
    use super::super::core::*;
    use super::super::packet::*;
    use super::super::psm::*;
    use super::super::signaling::*;
    use super::super::types::*;
    use super::super::*;
    use crate::error::LinkError;
    use crate::gap::BdAddr;
    use std::sync::{Arc, Mutex, Weak};
    use std::time::{Duration, Instant};

    const PEER: BdAddr = BdAddr {
        bytes: [0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
    };
    const HANDLE: u16 = 0x002A;
    const REMOTE_CID: u16 = 0x0050;

    /// Link layer that records what the engine asks of it
    #[derive(Default)]
    struct MockLink {
        opened: Mutex<Vec<BdAddr>>,
        accepted: Mutex<Vec<BdAddr>>,
        closed: Mutex<Vec<u16>>,
        sent: Mutex<Vec<(u16, Vec<u8>)>>,
    }

    impl LowerLayer for MockLink {
        fn open_connection(&self, peer: BdAddr) -> Result<(), LinkError> {
            self.opened.lock().unwrap().push(peer);
            Ok(())
        }

        fn accept_connection(&self, peer: BdAddr) -> Result<(), LinkError> {
            self.accepted.lock().unwrap().push(peer);
            Ok(())
        }

        fn close_connection(&self, handle: u16) -> Result<(), LinkError> {
            self.closed.lock().unwrap().push(handle);
            Ok(())
        }

        fn send_pdu(&self, handle: u16, pdu: &[u8]) -> Result<(), LinkError> {
            self.sent.lock().unwrap().push((handle, pdu.to_vec()));
            Ok(())
        }
    }

    struct TestNode {
        manager: L2capManager,
        link: Arc<MockLink>,
        events: Arc<Mutex<Vec<ChannelEvent>>>,
    }

    impl TestNode {
        fn new(config: L2capConfig) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();

            let link = Arc::new(MockLink::default());
            let manager = L2capManager::new(config, link.clone()).unwrap();
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = events.clone();
            manager.set_global_event_callback(move |event| {
                sink.lock().unwrap().push(event);
                Ok(())
            });

            Self {
                manager,
                link,
                events,
            }
        }

        fn take_events(&self) -> Vec<ChannelEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn take_frames(&self) -> Vec<L2capPacket> {
            std::mem::take(&mut *self.link.sent.lock().unwrap())
                .into_iter()
                .map(|(handle, pdu)| {
                    assert_eq!(handle, HANDLE);
                    L2capPacket::parse(&pdu).unwrap()
                })
                .collect()
        }

        /// Signaling commands sent since the last call
        fn take_signals(&self) -> Vec<SignalingMessage> {
            self.take_frames()
                .into_iter()
                .filter(|packet| packet.header.channel_id == L2CAP_SIGNALING_CID)
                .flat_map(|packet| SignalingMessage::parse_frame(&packet.payload))
                .map(|message| message.unwrap())
                .collect()
        }

        fn inject(&self, message: SignalingMessage) {
            self.manager
                .on_lower_pdu_received(HANDLE, &message.to_packet().to_bytes());
        }

        /// Open a channel to PEER and answer the connection request
        fn open_channel(&self, psm: PSM) -> ChannelId {
            let cid = self.manager.channel_open_request(psm, PEER).unwrap();
            if self.manager.connection_state(PEER) == Some(ConnectionState::WaitLowerConfirm) {
                self.manager.on_lower_connected(PEER, HANDLE);
            }

            let identifier = match self.take_signals().as_slice() {
                [SignalingMessage::ConnectionRequest {
                    identifier,
                    source_cid,
                    ..
                }] => {
                    assert_eq!(*source_cid, cid);
                    *identifier
                }
                other => panic!("Expected ConnectionRequest, got {:?}", other),
            };

            self.inject(SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: REMOTE_CID + cid - L2CAP_DYNAMIC_CID_MIN,
                source_cid: cid,
                result: L2CAP_RESULT_SUCCESS,
                status: L2CAP_STATUS_NO_INFO,
            });
            assert_eq!(self.take_events(), vec![ChannelEvent::Connected { cid, psm }]);
            cid
        }

        /// Bring up a link the peer asked for
        fn accept_link(&self) {
            self.manager.on_lower_connection_indication(PEER);
            self.manager.on_lower_connected(PEER, HANDLE);
            assert_eq!(self.manager.connection_state(PEER), Some(ConnectionState::Open));
        }
    }

    fn default_node() -> TestNode {
        TestNode::new(L2capConfig::default())
    }

    fn recorder() -> (ChannelEventCallback, Arc<Mutex<Vec<ChannelEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: ChannelEventCallback = Arc::new(Mutex::new(
            move |event: ChannelEvent| -> L2capResult<()> {
                sink.lock().unwrap().push(event);
                Ok(())
            },
        ));
        (callback, events)
    }

    #[test]
    fn test_manager_refuses_unbounded_timeouts() {
        let link = Arc::new(MockLink::default());
        let config = L2capConfig::default().with_connect_timeout(Duration::MAX);
        assert!(matches!(
            L2capManager::new(config, link.clone()),
            Err(L2capError::InvalidParameter(_))
        ));

        let config = L2capConfig::default().with_idle_disconnect_timeout(Some(Duration::MAX));
        assert!(L2capManager::new(config, link).is_err());
    }

    #[test]
    fn test_psm_registration() {
        let node = default_node();
        let policy = ConnectionPolicy { auto_accept: true };

        assert!(node.manager.register_psm(PSM::RFCOMM, None, policy).is_ok());

        // Test PSM registration fails for duplicate
        assert!(matches!(
            node.manager.register_psm(PSM::RFCOMM, None, policy),
            Err(L2capError::InvalidParameter(_))
        ));
        assert!(matches!(
            node.manager.register_psm(PSM(0x0002), None, policy),
            Err(L2capError::InvalidParameter(_))
        ));

        assert!(node.manager.unregister_psm(PSM::RFCOMM).is_ok());
        assert!(matches!(
            node.manager.unregister_psm(PSM::RFCOMM),
            Err(L2capError::PsmNotRegistered)
        ));
    }

    #[test]
    fn test_open_channel_waits_for_link() {
        let node = default_node();

        let cid = node.manager.channel_open_request(PSM::SDP, PEER).unwrap();
        assert_eq!(cid, L2CAP_DYNAMIC_CID_MIN);
        assert_eq!(*node.link.opened.lock().unwrap(), vec![PEER]);
        assert_eq!(
            node.manager.connection_state(PEER),
            Some(ConnectionState::WaitLowerConfirm)
        );
        assert_eq!(node.manager.channel_state(cid), Some(L2capChannelState::WaitConnect));

        // Queued but not sent before the link is up
        let commands = node.manager.pending_commands(PEER);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].code, L2CAP_CONNECTION_REQUEST);
        assert!(!commands[0].pending);
        assert!(node.take_frames().is_empty());

        node.manager.on_lower_connected(PEER, HANDLE);
        let signals = node.take_signals();
        assert_eq!(
            signals,
            vec![SignalingMessage::ConnectionRequest {
                identifier: commands[0].ident,
                psm: PSM::SDP,
                source_cid: cid,
            }]
        );
        assert!(node.manager.pending_commands(PEER)[0].pending);
        // Connect timer gone, command timer armed
        assert_eq!(node.manager.timer_count(), 1);

        node.inject(SignalingMessage::ConnectionResponse {
            identifier: commands[0].ident,
            destination_cid: REMOTE_CID,
            source_cid: cid,
            result: L2CAP_RESULT_SUCCESS,
            status: L2CAP_STATUS_NO_INFO,
        });

        assert_eq!(node.take_events(), vec![ChannelEvent::Connected { cid, psm: PSM::SDP }]);
        assert_eq!(node.manager.channel_state(cid), Some(L2capChannelState::Open));
        assert_eq!(node.manager.channel_info(cid).unwrap().remote_cid, REMOTE_CID);
        assert!(node.manager.pending_commands(PEER).is_empty());
        assert_eq!(node.manager.timer_count(), 0);
    }

    #[test]
    fn test_channels_share_connection() {
        let node = default_node();
        let first = node.manager.channel_open_request(PSM::SDP, PEER).unwrap();
        let second = node.manager.channel_open_request(PSM::RFCOMM, PEER).unwrap();

        assert_eq!(node.manager.connection_count(), 1);
        assert_eq!(*node.link.opened.lock().unwrap(), vec![PEER]);
        assert_eq!(node.manager.pending_commands(PEER).len(), 2);

        node.manager.on_lower_connected(PEER, HANDLE);
        assert_eq!(node.take_signals().len(), 2);

        node.manager.channel_close(first).unwrap();
        assert_eq!(
            node.take_events(),
            vec![ChannelEvent::OpenFailed {
                cid: first,
                psm: PSM::SDP,
                reason: CloseReason::Cancelled,
            }]
        );
        assert_eq!(node.manager.connection_state(PEER), Some(ConnectionState::Open));
        assert_eq!(node.manager.channel_state(second), Some(L2capChannelState::WaitConnect));

        let commands = node.manager.pending_commands(PEER);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].target, CommandTarget::Channel { cid: second });
        assert!(node.link.closed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_connection_request_retransmitted_once() {
        let node = default_node();
        let cid = node.manager.channel_open_request(PSM::SDP, PEER).unwrap();
        node.manager.on_lower_connected(PEER, HANDLE);
        let first = node.take_signals();
        assert_eq!(first.len(), 1);

        node.manager
            .process_timeouts_at(Instant::now() + Duration::from_secs(61));

        // Same command, same identifier
        assert_eq!(node.take_signals(), first);
        let commands = node.manager.pending_commands(PEER);
        assert_eq!(commands[0].retransmits, 1);

        node.inject(SignalingMessage::ConnectionResponse {
            identifier: first[0].identifier(),
            destination_cid: REMOTE_CID,
            source_cid: cid,
            result: L2CAP_RESULT_SUCCESS,
            status: L2CAP_STATUS_NO_INFO,
        });
        assert_eq!(node.take_events(), vec![ChannelEvent::Connected { cid, psm: PSM::SDP }]);
    }

    #[test]
    fn test_disconnect_times_out_after_retransmission() {
        let node = default_node();
        let cid = node.open_channel(PSM::SDP);

        node.manager.channel_close(cid).unwrap();
        assert_eq!(node.manager.channel_state(cid), Some(L2capChannelState::WaitDisconnect));
        let request = node.take_signals();
        assert!(matches!(
            request.as_slice(),
            [SignalingMessage::DisconnectionRequest { destination_cid: REMOTE_CID, source_cid, .. }]
                if *source_cid == cid
        ));
        assert!(matches!(
            node.manager.channel_close(cid),
            Err(L2capError::InvalidState)
        ));

        let start = Instant::now();
        node.manager.process_timeouts_at(start + Duration::from_secs(61));
        assert_eq!(node.take_signals(), request);
        assert!(node.take_events().is_empty());

        node.manager.process_timeouts_at(start + Duration::from_secs(200));
        assert!(node.take_signals().is_empty());
        assert_eq!(
            node.take_events(),
            vec![ChannelEvent::Disconnected {
                cid,
                psm: PSM::SDP,
                reason: CloseReason::Timeout,
            }]
        );
        assert_eq!(node.manager.channel_state(cid), None);

        // Nothing left on the link, so it goes too
        assert_eq!(*node.link.closed.lock().unwrap(), vec![HANDLE]);
        assert_eq!(node.manager.connection_count(), 0);
        assert_eq!(node.manager.timer_count(), 0);
    }

    #[test]
    fn test_link_loss_tears_everything_down() {
        let node = default_node();
        let cid = node.open_channel(PSM::SDP);
        node.manager.ping(PEER, b"abc", 7).unwrap();
        node.take_frames();

        node.manager.on_lower_disconnected(HANDLE, 0x13);

        let events = node.take_events();
        assert_eq!(events.len(), 2);
        assert!(events.contains(&ChannelEvent::RequestFailed {
            token: 7,
            reason: CloseReason::LinkLost(0x13),
        }));
        assert!(events.contains(&ChannelEvent::Disconnected {
            cid,
            psm: PSM::SDP,
            reason: CloseReason::LinkLost(0x13),
        }));
        assert_eq!(node.manager.connection_count(), 0);
        assert_eq!(node.manager.channel_count(), 0);
        assert_eq!(node.manager.timer_count(), 0);
        assert!(node.link.closed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_link_failure_fails_open() {
        let node = default_node();
        let cid = node.manager.channel_open_request(PSM::SDP, PEER).unwrap();

        node.manager.on_lower_connect_failed(PEER, 0x04);

        assert_eq!(
            node.take_events(),
            vec![ChannelEvent::OpenFailed {
                cid,
                psm: PSM::SDP,
                reason: CloseReason::LinkFailed(0x04),
            }]
        );
        assert_eq!(node.manager.connection_count(), 0);
        assert_eq!(node.manager.timer_count(), 0);
    }

    #[test]
    fn test_link_confirm_timeout() {
        let node = default_node();
        let cid = node.manager.channel_open_request(PSM::SDP, PEER).unwrap();

        node.manager
            .process_timeouts_at(Instant::now() + Duration::from_secs(61));

        assert_eq!(
            node.take_events(),
            vec![ChannelEvent::OpenFailed {
                cid,
                psm: PSM::SDP,
                reason: CloseReason::LinkFailed(LINK_REASON_TIMEOUT),
            }]
        );
        assert_eq!(node.manager.connection_state(PEER), None);
    }

    #[test]
    fn test_open_failure_from_lower_layer_call() {
        struct DeadLink;

        impl LowerLayer for DeadLink {
            fn open_connection(&self, _peer: BdAddr) -> Result<(), LinkError> {
                Err(LinkError::ConnectFailed(0x0D))
            }

            fn close_connection(&self, _handle: u16) -> Result<(), LinkError> {
                Err(LinkError::LinkDown)
            }

            fn send_pdu(&self, _handle: u16, _pdu: &[u8]) -> Result<(), LinkError> {
                Err(LinkError::LinkDown)
            }
        }

        let manager = L2capManager::new(L2capConfig::default(), Arc::new(DeadLink)).unwrap();
        let (callback, events) = recorder();
        manager
            .register_psm(PSM::SDP, Some(callback), ConnectionPolicy::default())
            .unwrap();

        let cid = manager.channel_open_request(PSM::SDP, PEER).unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![ChannelEvent::OpenFailed {
                cid,
                psm: PSM::SDP,
                reason: CloseReason::LinkFailed(0x0D),
            }]
        );
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn test_refused_connection() {
        let node = default_node();
        let cid = node.manager.channel_open_request(PSM::SDP, PEER).unwrap();
        node.manager.on_lower_connected(PEER, HANDLE);
        let identifier = node.take_signals()[0].identifier();

        node.inject(SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid: 0,
            source_cid: cid,
            result: L2CAP_RESULT_PSM_NOT_SUPPORTED,
            status: L2CAP_STATUS_NO_INFO,
        });

        assert_eq!(
            node.take_events(),
            vec![ChannelEvent::OpenFailed {
                cid,
                psm: PSM::SDP,
                reason: CloseReason::Rejected(L2CAP_RESULT_PSM_NOT_SUPPORTED),
            }]
        );
        assert_eq!(node.manager.channel_count(), 0);
        assert_eq!(*node.link.closed.lock().unwrap(), vec![HANDLE]);
    }

    #[test]
    fn test_pending_response_extends_timeout() {
        let node = default_node();
        let cid = node.manager.channel_open_request(PSM::SDP, PEER).unwrap();
        node.manager.on_lower_connected(PEER, HANDLE);
        let identifier = node.take_signals()[0].identifier();

        node.inject(SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid: REMOTE_CID,
            source_cid: cid,
            result: L2CAP_RESULT_PENDING,
            status: L2CAP_STATUS_AUTHORIZATION_PENDING,
        });
        assert_eq!(node.manager.channel_state(cid), Some(L2capChannelState::WaitConnect));

        let start = Instant::now();
        node.manager.process_timeouts_at(start + Duration::from_secs(61));
        assert!(node.take_signals().is_empty());

        node.manager.process_timeouts_at(start + Duration::from_secs(301));
        assert_eq!(node.take_signals().len(), 1);
        assert_eq!(node.manager.pending_commands(PEER)[0].retransmits, 1);
    }

    #[test]
    fn test_incoming_channel_auto_accepted() {
        let node = default_node();
        node.manager
            .register_psm(PSM::RFCOMM, None, ConnectionPolicy { auto_accept: true })
            .unwrap();

        node.manager.on_lower_connection_indication(PEER);
        assert_eq!(*node.link.accepted.lock().unwrap(), vec![PEER]);
        node.manager.on_lower_connected(PEER, HANDLE);

        node.inject(SignalingMessage::ConnectionRequest {
            identifier: 7,
            psm: PSM::RFCOMM,
            source_cid: 0x0077,
        });

        let cid = L2CAP_DYNAMIC_CID_MIN;
        assert_eq!(
            node.take_signals(),
            vec![SignalingMessage::ConnectionResponse {
                identifier: 7,
                destination_cid: cid,
                source_cid: 0x0077,
                result: L2CAP_RESULT_SUCCESS,
                status: L2CAP_STATUS_NO_INFO,
            }]
        );
        assert_eq!(node.take_events(), vec![ChannelEvent::Connected { cid, psm: PSM::RFCOMM }]);
        assert_eq!(node.manager.channel_state(cid), Some(L2capChannelState::Open));
    }

    #[test]
    fn test_incoming_channel_waits_for_upper_layer() {
        let node = default_node();
        node.manager
            .register_psm(PSM::RFCOMM, None, ConnectionPolicy::default())
            .unwrap();
        node.accept_link();

        node.inject(SignalingMessage::ConnectionRequest {
            identifier: 3,
            psm: PSM::RFCOMM,
            source_cid: 0x0077,
        });

        let cid = match node.take_events().as_slice() {
            [ChannelEvent::ConnectionRequest { cid, psm, peer }] => {
                assert_eq!(*psm, PSM::RFCOMM);
                assert_eq!(*peer, PEER);
                *cid
            }
            other => panic!("Expected ConnectionRequest, got {:?}", other),
        };
        assert_eq!(node.manager.channel_state(cid), Some(L2capChannelState::WaitConnectRsp));
        assert!(matches!(
            node.take_signals().as_slice(),
            [SignalingMessage::ConnectionResponse { result: L2CAP_RESULT_PENDING, .. }]
        ));

        node.manager.channel_accept(cid).unwrap();
        assert!(matches!(
            node.take_signals().as_slice(),
            [SignalingMessage::ConnectionResponse {
                identifier: 3,
                result: L2CAP_RESULT_SUCCESS,
                ..
            }]
        ));
        assert_eq!(node.take_events(), vec![ChannelEvent::Connected { cid, psm: PSM::RFCOMM }]);
        assert!(matches!(
            node.manager.channel_accept(cid),
            Err(L2capError::InvalidState)
        ));
    }

    #[test]
    fn test_incoming_channel_rejected() {
        let node = default_node();
        node.manager
            .register_psm(PSM::RFCOMM, None, ConnectionPolicy::default())
            .unwrap();
        node.accept_link();
        node.inject(SignalingMessage::ConnectionRequest {
            identifier: 3,
            psm: PSM::RFCOMM,
            source_cid: 0x0077,
        });
        node.take_signals();
        let cid = L2CAP_DYNAMIC_CID_MIN;

        assert!(node.manager.channel_reject(cid, L2CAP_RESULT_SUCCESS).is_err());
        node.manager
            .channel_reject(cid, L2CAP_RESULT_SECURITY_BLOCK)
            .unwrap();

        assert_eq!(
            node.take_signals(),
            vec![SignalingMessage::ConnectionResponse {
                identifier: 3,
                destination_cid: 0,
                source_cid: 0x0077,
                result: L2CAP_RESULT_SECURITY_BLOCK,
                status: L2CAP_STATUS_NO_INFO,
            }]
        );
        assert_eq!(node.manager.channel_count(), 0);
    }

    #[test]
    fn test_incoming_request_for_unregistered_psm() {
        let node = default_node();
        node.accept_link();

        node.inject(SignalingMessage::ConnectionRequest {
            identifier: 5,
            psm: PSM::HID_CONTROL,
            source_cid: 0x0077,
        });

        assert!(matches!(
            node.take_signals().as_slice(),
            [SignalingMessage::ConnectionResponse {
                identifier: 5,
                result: L2CAP_RESULT_PSM_NOT_SUPPORTED,
                ..
            }]
        ));
        assert_eq!(node.manager.channel_count(), 0);
        assert!(node.take_events().is_empty());
    }

    #[test]
    fn test_remote_disconnect() {
        let node = default_node();
        let cid = node.open_channel(PSM::SDP);

        node.inject(SignalingMessage::DisconnectionRequest {
            identifier: 9,
            destination_cid: cid,
            source_cid: REMOTE_CID,
        });

        assert_eq!(
            node.take_signals(),
            vec![SignalingMessage::DisconnectionResponse {
                identifier: 9,
                destination_cid: cid,
                source_cid: REMOTE_CID,
            }]
        );
        assert_eq!(
            node.take_events(),
            vec![ChannelEvent::Disconnected {
                cid,
                psm: PSM::SDP,
                reason: CloseReason::RemoteRequest,
            }]
        );
    }

    #[test]
    fn test_local_disconnect_completes_on_response() {
        let node = default_node();
        let cid = node.open_channel(PSM::SDP);

        node.manager.channel_close(cid).unwrap();
        let identifier = node.take_signals()[0].identifier();
        node.inject(SignalingMessage::DisconnectionResponse {
            identifier,
            destination_cid: REMOTE_CID,
            source_cid: cid,
        });

        assert_eq!(
            node.take_events(),
            vec![ChannelEvent::Disconnected {
                cid,
                psm: PSM::SDP,
                reason: CloseReason::LocalRequest,
            }]
        );
        assert_eq!(node.manager.connection_count(), 0);
    }

    #[test]
    fn test_disconnect_for_unknown_channel_rejected() {
        let node = default_node();
        node.accept_link();

        node.inject(SignalingMessage::DisconnectionRequest {
            identifier: 4,
            destination_cid: 0x0123,
            source_cid: 0x0456,
        });

        assert_eq!(
            node.take_signals(),
            vec![SignalingMessage::CommandReject {
                identifier: 4,
                reason: L2CAP_REJECT_INVALID_CID,
                data: vec![0x23, 0x01, 0x56, 0x04],
            }]
        );
    }

    #[test]
    fn test_unknown_command_rejected() {
        let node = default_node();
        node.accept_link();

        let frame = L2capPacket::new(L2CAP_SIGNALING_CID, vec![0x30, 0x05, 0x00, 0x00]);
        node.manager.on_lower_pdu_received(HANDLE, &frame.to_bytes());

        assert_eq!(
            node.take_signals(),
            vec![SignalingMessage::CommandReject {
                identifier: 5,
                reason: L2CAP_REJECT_NOT_UNDERSTOOD,
                data: vec![],
            }]
        );
    }

    #[test]
    fn test_unsolicited_response_dropped() {
        let node = default_node();
        let cid = node.open_channel(PSM::SDP);

        node.inject(SignalingMessage::EchoResponse {
            identifier: 200,
            data: vec![1],
        });
        node.inject(SignalingMessage::ConnectionResponse {
            identifier: 201,
            destination_cid: 0x0099,
            source_cid: cid,
            result: L2CAP_RESULT_SUCCESS,
            status: L2CAP_STATUS_NO_INFO,
        });

        assert!(node.take_events().is_empty());
        assert!(node.take_signals().is_empty());
        assert_eq!(node.manager.channel_info(cid).unwrap().remote_cid, REMOTE_CID);
    }

    #[test]
    fn test_mismatched_response_leaves_command_pending() {
        let node = default_node();
        node.accept_link();
        node.manager.ping(PEER, b"x", 1).unwrap();
        let identifier = node.take_signals()[0].identifier();

        node.inject(SignalingMessage::InformationResponse {
            identifier,
            info_type: L2CAP_INFO_EXTENDED_FEATURES,
            result: L2CAP_INFO_SUCCESS,
            data: vec![0, 0, 0, 0],
        });

        assert!(node.take_events().is_empty());
        assert_eq!(node.manager.pending_commands(PEER).len(), 1);
    }

    #[test]
    fn test_echo_round_trip() {
        let node = default_node();
        assert!(matches!(
            node.manager.ping(PEER, b"hello", 42),
            Err(L2capError::NotConnected)
        ));
        node.accept_link();

        node.manager.ping(PEER, b"hello", 42).unwrap();
        let identifier = match node.take_signals().as_slice() {
            [SignalingMessage::EchoRequest { identifier, data }] => {
                assert_eq!(data, b"hello");
                *identifier
            }
            other => panic!("Expected EchoRequest, got {:?}", other),
        };

        node.inject(SignalingMessage::EchoResponse {
            identifier,
            data: b"hello".to_vec(),
        });
        assert_eq!(
            node.take_events(),
            vec![ChannelEvent::EchoResponse {
                token: 42,
                data: b"hello".to_vec(),
            }]
        );
        assert!(node.manager.pending_commands(PEER).is_empty());
    }

    #[test]
    fn test_oversized_echo_refused_without_side_effects() {
        let node = default_node();
        node.accept_link();

        let data = vec![0u8; 70_000];
        assert!(matches!(
            node.manager.ping(PEER, &data, 7),
            Err(L2capError::InvalidParameter(_))
        ));
        assert!(node.manager.pending_commands(PEER).is_empty());
        assert_eq!(node.manager.timer_count(), 0);
        assert!(node.take_frames().is_empty());

        // the largest payload that fits still goes out intact
        let data = vec![0x5Au8; L2CAP_MAX_ECHO_DATA];
        node.manager.ping(PEER, &data, 8).unwrap();
        match node.take_signals().as_slice() {
            [SignalingMessage::EchoRequest { data: sent, .. }] => assert_eq!(sent.len(), data.len()),
            other => panic!("Expected EchoRequest, got {:?}", other),
        }
        assert_eq!(node.manager.pending_commands(PEER).len(), 1);
    }

    #[test]
    fn test_info_request_rejected_by_peer() {
        let node = default_node();
        node.accept_link();

        node.manager
            .get_info(PEER, L2CAP_INFO_FIXED_CHANNELS, 11)
            .unwrap();
        let identifier = node.take_signals()[0].identifier();
        node.inject(SignalingMessage::CommandReject {
            identifier,
            reason: L2CAP_REJECT_NOT_UNDERSTOOD,
            data: vec![],
        });

        assert_eq!(
            node.take_events(),
            vec![ChannelEvent::RequestFailed {
                token: 11,
                reason: CloseReason::Rejected(L2CAP_REJECT_NOT_UNDERSTOOD),
            }]
        );
    }

    #[test]
    fn test_answers_peer_echo_and_info() {
        let node = default_node();
        node.accept_link();

        node.inject(SignalingMessage::EchoRequest {
            identifier: 1,
            data: vec![9, 8],
        });
        node.inject(SignalingMessage::InformationRequest {
            identifier: 2,
            info_type: L2CAP_INFO_CONNECTIONLESS_MTU,
        });
        node.inject(SignalingMessage::InformationRequest {
            identifier: 3,
            info_type: L2CAP_INFO_FIXED_CHANNELS,
        });
        node.inject(SignalingMessage::InformationRequest {
            identifier: 4,
            info_type: 0x0042,
        });

        assert_eq!(
            node.take_signals(),
            vec![
                SignalingMessage::EchoResponse {
                    identifier: 1,
                    data: vec![9, 8],
                },
                SignalingMessage::InformationResponse {
                    identifier: 2,
                    info_type: L2CAP_INFO_CONNECTIONLESS_MTU,
                    result: L2CAP_INFO_SUCCESS,
                    data: vec![0xA0, 0x02],
                },
                SignalingMessage::InformationResponse {
                    identifier: 3,
                    info_type: L2CAP_INFO_FIXED_CHANNELS,
                    result: L2CAP_INFO_SUCCESS,
                    data: vec![0x06, 0, 0, 0, 0, 0, 0, 0],
                },
                SignalingMessage::InformationResponse {
                    identifier: 4,
                    info_type: 0x0042,
                    result: L2CAP_INFO_NOT_SUPPORTED,
                    data: vec![],
                },
            ]
        );
    }

    #[test]
    fn test_several_commands_in_one_frame() {
        let node = default_node();
        node.accept_link();

        let mut payload = SignalingMessage::EchoRequest {
            identifier: 1,
            data: vec![],
        }
        .serialize();
        payload.extend(
            SignalingMessage::EchoRequest {
                identifier: 2,
                data: vec![],
            }
            .serialize(),
        );
        let frame = L2capPacket::new(L2CAP_SIGNALING_CID, payload);
        node.manager.on_lower_pdu_received(HANDLE, &frame.to_bytes());

        let idents: Vec<SignalId> = node
            .take_signals()
            .iter()
            .map(SignalingMessage::identifier)
            .collect();
        assert_eq!(idents, vec![1, 2]);
    }

    #[test]
    fn test_ident_exhaustion() {
        let node = default_node();
        node.accept_link();

        for token in 0..255 {
            node.manager.ping(PEER, &[], token).unwrap();
        }
        assert!(matches!(
            node.manager.ping(PEER, &[], 255),
            Err(L2capError::ResourceLimitReached)
        ));

        let commands = node.manager.pending_commands(PEER);
        assert_eq!(commands.len(), 255);
        let mut idents: Vec<SignalId> = commands.iter().map(|cmd| cmd.ident).collect();
        idents.sort_unstable();
        idents.dedup();
        assert_eq!(idents.len(), 255);
        assert!(!idents.contains(&L2CAP_NULL_IDENT));
    }

    #[test]
    fn test_channel_ids_allocated_in_order() {
        let node = default_node();
        let first = node.open_channel(PSM::SDP);
        let second = node.open_channel(PSM::RFCOMM);
        assert_eq!(first, L2CAP_DYNAMIC_CID_MIN);
        assert_eq!(second, L2CAP_DYNAMIC_CID_MIN + 1);

        // A freed CID is not handed out again right away
        node.inject(SignalingMessage::DisconnectionRequest {
            identifier: 1,
            destination_cid: first,
            source_cid: REMOTE_CID,
        });
        node.take_events();
        node.take_signals();
        let third = node.open_channel(PSM::SDP);
        assert_eq!(third, L2CAP_DYNAMIC_CID_MIN + 2);
    }

    #[test]
    fn test_data_transfer() {
        let node = default_node();
        let cid = node.open_channel(PSM::SDP);
        let remote = node.manager.channel_info(cid).unwrap().remote_cid;

        node.manager.channel_send(cid, &[1, 2, 3]).unwrap();
        let frames = node.take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header.channel_id, remote);
        assert_eq!(frames[0].payload, vec![1, 2, 3]);

        let too_big = vec![0u8; L2CAP_DEFAULT_MTU as usize + 1];
        assert!(matches!(
            node.manager.channel_send(cid, &too_big),
            Err(L2capError::MtuExceeded)
        ));
        assert!(matches!(
            node.manager.channel_send(0x0999, &[1]),
            Err(L2capError::ChannelNotFound)
        ));

        let inbound = L2capPacket::new(cid, vec![4, 5]);
        node.manager.on_lower_pdu_received(HANDLE, &inbound.to_bytes());
        assert_eq!(
            node.take_events(),
            vec![ChannelEvent::Data {
                cid,
                data: vec![4, 5],
            }]
        );

        // Unknown CID and broken frames are dropped
        let stray = L2capPacket::new(0x0999, vec![1]);
        node.manager.on_lower_pdu_received(HANDLE, &stray.to_bytes());
        node.manager.on_lower_pdu_received(HANDLE, &[0x05, 0x00, 0x40]);
        assert!(node.take_events().is_empty());
    }

    #[test]
    fn test_send_before_open_fails() {
        let node = default_node();
        let cid = node.manager.channel_open_request(PSM::SDP, PEER).unwrap();
        assert!(matches!(
            node.manager.channel_send(cid, &[1]),
            Err(L2capError::InvalidState)
        ));
    }

    #[test]
    fn test_close_before_link_up_cancels_open() {
        let node = default_node();
        let cid = node.manager.channel_open_request(PSM::SDP, PEER).unwrap();

        node.manager.channel_close(cid).unwrap();
        assert_eq!(
            node.take_events(),
            vec![ChannelEvent::OpenFailed {
                cid,
                psm: PSM::SDP,
                reason: CloseReason::Cancelled,
            }]
        );
        assert!(node.manager.pending_commands(PEER).is_empty());

        // The link is dropped as soon as it comes up
        node.manager.on_lower_connected(PEER, HANDLE);
        assert!(node.take_frames().is_empty());
        assert_eq!(*node.link.closed.lock().unwrap(), vec![HANDLE]);
        assert_eq!(node.manager.connection_count(), 0);
    }

    #[test]
    fn test_configuration_exchange() {
        let node = TestNode::new(L2capConfig::default().with_auto_configure(true));
        let cid = node.manager.channel_open_request(PSM::SDP, PEER).unwrap();
        node.manager.on_lower_connected(PEER, HANDLE);
        let identifier = node.take_signals()[0].identifier();
        node.inject(SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid: REMOTE_CID,
            source_cid: cid,
            result: L2CAP_RESULT_SUCCESS,
            status: L2CAP_STATUS_NO_INFO,
        });
        assert_eq!(node.manager.channel_state(cid), Some(L2capChannelState::Config));
        assert!(node.take_events().is_empty());

        let expected = ConfigOptions {
            mtu: Some(L2CAP_DEFAULT_MTU),
            ..Default::default()
        };
        let identifier = match node.take_signals().as_slice() {
            [SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid: REMOTE_CID,
                options,
                ..
            }] => {
                assert_eq!(*options, expected);
                *identifier
            }
            other => panic!("Expected ConfigureRequest, got {:?}", other),
        };

        node.inject(SignalingMessage::ConfigureResponse {
            identifier,
            source_cid: cid,
            flags: 0,
            result: L2CAP_CONF_SUCCESS,
            options: ConfigOptions::default(),
        });
        assert_eq!(
            node.take_events(),
            vec![ChannelEvent::ConfigChanged {
                cid,
                config: expected,
            }]
        );
        assert_eq!(node.manager.channel_state(cid), Some(L2capChannelState::Config));

        // The peer's request in two parts
        node.inject(SignalingMessage::ConfigureRequest {
            identifier: 50,
            destination_cid: cid,
            flags: L2CAP_CONF_FLAG_CONTINUATION,
            options: ConfigOptions::default(),
        });
        assert_eq!(node.manager.channel_state(cid), Some(L2capChannelState::Config));
        node.inject(SignalingMessage::ConfigureRequest {
            identifier: 51,
            destination_cid: cid,
            flags: 0,
            options: ConfigOptions {
                mtu: Some(500),
                ..Default::default()
            },
        });

        let responses = node.take_signals();
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|message| matches!(
            message,
            SignalingMessage::ConfigureResponse {
                source_cid: REMOTE_CID,
                result: L2CAP_CONF_SUCCESS,
                ..
            }
        )));
        assert_eq!(node.take_events(), vec![ChannelEvent::Connected { cid, psm: PSM::SDP }]);
        assert_eq!(node.manager.channel_state(cid), Some(L2capChannelState::Open));
        assert_eq!(node.manager.channel_info(cid).unwrap().outgoing_mtu, 500);
    }

    #[test]
    fn test_configuration_refused_closes_channel() {
        let node = TestNode::new(L2capConfig::default().with_auto_configure(true));
        let cid = node.manager.channel_open_request(PSM::SDP, PEER).unwrap();
        node.manager.on_lower_connected(PEER, HANDLE);
        let identifier = node.take_signals()[0].identifier();
        node.inject(SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid: REMOTE_CID,
            source_cid: cid,
            result: L2CAP_RESULT_SUCCESS,
            status: L2CAP_STATUS_NO_INFO,
        });
        let identifier = node.take_signals()[0].identifier();

        node.inject(SignalingMessage::ConfigureResponse {
            identifier,
            source_cid: cid,
            flags: 0,
            result: L2CAP_CONF_REJECTED,
            options: ConfigOptions::default(),
        });
        assert_eq!(
            node.take_events(),
            vec![ChannelEvent::ConfigFailed {
                cid,
                reason: CloseReason::ConfigRejected(L2CAP_CONF_REJECTED),
            }]
        );
        assert_eq!(node.manager.channel_state(cid), Some(L2capChannelState::WaitDisconnect));

        let identifier = match node.take_signals().as_slice() {
            [SignalingMessage::DisconnectionRequest { identifier, .. }] => *identifier,
            other => panic!("Expected DisconnectionRequest, got {:?}", other),
        };
        node.inject(SignalingMessage::DisconnectionResponse {
            identifier,
            destination_cid: REMOTE_CID,
            source_cid: cid,
        });
        assert_eq!(
            node.take_events(),
            vec![ChannelEvent::OpenFailed {
                cid,
                psm: PSM::SDP,
                reason: CloseReason::ConfigRejected(L2CAP_CONF_REJECTED),
            }]
        );
    }

    #[test]
    fn test_small_mtu_refused() {
        let node = default_node();
        let cid = node.open_channel(PSM::SDP);

        node.inject(SignalingMessage::ConfigureRequest {
            identifier: 8,
            destination_cid: cid,
            flags: 0,
            options: ConfigOptions {
                mtu: Some(20),
                ..Default::default()
            },
        });

        assert_eq!(
            node.take_signals(),
            vec![SignalingMessage::ConfigureResponse {
                identifier: 8,
                source_cid: REMOTE_CID,
                flags: 0,
                result: L2CAP_CONF_UNACCEPTABLE_PARAMS,
                options: ConfigOptions {
                    mtu: Some(L2CAP_MIN_MTU),
                    ..Default::default()
                },
            }]
        );
        assert_eq!(
            node.manager.channel_info(cid).unwrap().outgoing_mtu,
            L2CAP_DEFAULT_MTU
        );
    }

    #[test]
    fn test_idle_link_closed_after_timeout() {
        let config =
            L2capConfig::default().with_idle_disconnect_timeout(Some(Duration::from_secs(10)));
        let node = TestNode::new(config);
        let cid = node.open_channel(PSM::SDP);

        node.inject(SignalingMessage::DisconnectionRequest {
            identifier: 1,
            destination_cid: cid,
            source_cid: REMOTE_CID,
        });
        assert_eq!(node.manager.connection_state(PEER), Some(ConnectionState::Open));
        assert_eq!(node.manager.timer_count(), 1);

        // New work on the link stops the idle timer
        node.manager.ping(PEER, &[], 1).unwrap();
        let identifier = node
            .take_signals()
            .into_iter()
            .find(|message| matches!(message, SignalingMessage::EchoRequest { .. }))
            .map(|message| message.identifier())
            .unwrap();
        node.inject(SignalingMessage::EchoResponse {
            identifier,
            data: vec![],
        });
        assert_eq!(node.manager.timer_count(), 1);

        node.manager
            .process_timeouts_at(Instant::now() + Duration::from_secs(11));
        assert_eq!(*node.link.closed.lock().unwrap(), vec![HANDLE]);
        assert_eq!(node.manager.connection_count(), 0);
    }

    #[test]
    fn test_per_psm_callback_takes_precedence() {
        let node = default_node();
        let (callback, psm_events) = recorder();
        node.manager
            .register_psm(PSM::SDP, Some(callback), ConnectionPolicy::default())
            .unwrap();

        let cid = node.manager.channel_open_request(PSM::SDP, PEER).unwrap();
        node.manager.on_lower_connect_failed(PEER, 0x05);

        assert!(node.take_events().is_empty());
        assert_eq!(
            *psm_events.lock().unwrap(),
            vec![ChannelEvent::OpenFailed {
                cid,
                psm: PSM::SDP,
                reason: CloseReason::LinkFailed(0x05),
            }]
        );
    }

    #[test]
    fn test_callback_may_call_back_into_manager() {
        let _ = env_logger::builder().is_test(true).try_init();
        let link = Arc::new(MockLink::default());
        let manager = Arc::new(L2capManager::new(L2capConfig::default(), link.clone()).unwrap());
        let events = Arc::new(Mutex::new(Vec::new()));

        let weak: Weak<L2capManager> = Arc::downgrade(&manager);
        let sink = events.clone();
        let callback: ChannelEventCallback = Arc::new(Mutex::new(move |event: ChannelEvent| -> L2capResult<()> {
            if let ChannelEvent::ConnectionRequest { cid, .. } = event {
                if let Some(manager) = weak.upgrade() {
                    manager.channel_accept(cid)?;
                }
            }
            sink.lock().unwrap().push(event);
            Ok(())
        }));
        manager
            .register_psm(PSM::AVDTP, Some(callback), ConnectionPolicy::default())
            .unwrap();

        manager.on_lower_connection_indication(PEER);
        manager.on_lower_connected(PEER, HANDLE);
        let request = SignalingMessage::ConnectionRequest {
            identifier: 1,
            psm: PSM::AVDTP,
            source_cid: 0x0060,
        };
        manager.on_lower_pdu_received(HANDLE, &request.to_packet().to_bytes());

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ChannelEvent::ConnectionRequest { .. }));
        assert!(matches!(events[1], ChannelEvent::Connected { psm: PSM::AVDTP, .. }));
        assert_eq!(manager.channel_state(L2CAP_DYNAMIC_CID_MIN), Some(L2capChannelState::Open));
    }

    #[test]
    fn test_command_info_targets() {
        let node = default_node();
        let cid = node.manager.channel_open_request(PSM::SDP, PEER).unwrap();
        let commands = node.manager.pending_commands(PEER);
        assert_eq!(commands[0].target, CommandTarget::Channel { cid });
        assert_eq!(commands[0].target.channel(), Some(cid));
        assert_eq!(CommandTarget::Connection { token: 1 }.channel(), None);
    }
}
