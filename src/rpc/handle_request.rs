use std::net::SocketAddrV4;
use std::time::Instant;

use tracing::{debug, trace};

use crate::common::{
    FindResponseArguments, FindResponseSpecific, Message, MessageType, Node,
    PunctureRequestArguments,
};

use super::Rpc;

impl Rpc {
    /// Handle an inbound request: add the requester to the routing table,
    /// answer it through the server, and ask the closest node we return to
    /// puncture toward the requester.
    pub(super) fn handle_request(&mut self, from: SocketAddrV4, message: Message) {
        if message.public_key == *self.public_key() {
            trace!(?from, "Ignoring our own request");
            return;
        }

        let transaction_id = message.transaction_id;

        let request = match message.message_type {
            // Punctures only open NAT mappings, the sender is not a requester.
            MessageType::PunctureRequest(PunctureRequestArguments {
                lan_address,
                wan_address,
            }) => {
                trace!(?from, ?wan_address, ?lan_address, "Got puncture request");

                self.socket
                    .send(wan_address, transaction_id, MessageType::Puncture);

                if lan_address != wan_address && !lan_address.ip().is_unspecified() {
                    self.socket
                        .send(lan_address, transaction_id, MessageType::Puncture);
                }

                return;
            }
            MessageType::Puncture => {
                trace!(?from, "Got puncture");
                return;
            }
            request => request,
        };

        let requester = Node::new(message.public_key, from);
        let now = Instant::now();

        if self
            .routing_table
            .state(requester.id())
            .is_some_and(|state| state.is_blocked(now))
        {
            debug!(?from, "Too many queries, dropping packet");
            return;
        }

        self.routing_table.add(requester.clone());
        if let Some(state) = self.routing_table.state_mut(requester.id()) {
            state.record_query(now);
        }

        let Some(response) = self
            .server
            .handle_request(&self.routing_table, &requester, &request)
        else {
            return;
        };

        if let (
            MessageType::FindRequest(arguments),
            MessageType::FindResponse(FindResponseArguments {
                result: FindResponseSpecific::Nodes(nodes),
                ..
            }),
        ) = (&request, &response)
        {
            if let Some(closest) = nodes.first() {
                self.socket.send(
                    closest.address(),
                    transaction_id,
                    MessageType::PunctureRequest(PunctureRequestArguments {
                        lan_address: arguments.lan_address,
                        wan_address: from,
                    }),
                );
            }
        }

        self.socket.send(from, transaction_id, response);
    }
}
