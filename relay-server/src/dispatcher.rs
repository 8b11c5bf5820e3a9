//! Request dispatcher: reads one frame already handed to it by the acceptor/worker, routes
//! it by type, executes the handler against the core engine, and writes the response
//! (spec.md §4.6). Ancestor: `RcServer::read_incoming`/`handle_join`
//! (`examples/original_source/src/server.cpp`), generalized from a single JOIN command to
//! the full CH_* surface.

use std::io::{Cursor, Read};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use slog::{o, Logger};

use relay_core::{Channel, ChannelRegistry, Client, ClientRegistry, LeaveOutcome};
use relay_wire::{CommandCode, Frame, FrameType, ProtocolError, ERR_PROTOCOL};

use crate::error::DispatchError;
use crate::worker::ThreadPool;

/// What the acceptor should do with the connection after a frame has been handled.
#[derive(Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Re-arm readiness and keep reading.
    Continue,
    /// Run the disconnect sweep; the connection is done.
    Disconnect,
}

/// Owns references to both registries and the shared worker pool; stateless otherwise (all
/// per-connection state lives on `Client`). One `Dispatcher` is shared across every worker
/// thread and every connection.
pub struct Dispatcher {
    clients: Arc<ClientRegistry>,
    channels: Arc<ChannelRegistry>,
    workers: Arc<ThreadPool>,
    log: Logger,
}

impl Dispatcher {
    pub fn new(clients: Arc<ClientRegistry>, channels: Arc<ChannelRegistry>, workers: Arc<ThreadPool>, log: Logger) -> Dispatcher {
        Dispatcher { clients, channels, workers, log }
    }

    /// Handles one already-decoded frame for `client`. Never panics on malformed client
    /// input: every parse failure becomes a `-1`/`-3` response frame, never a dropped
    /// connection, except for `SVR_DISCONNECT` and genuinely unreadable frame types in the
    /// unconnected state.
    pub fn handle_frame(&self, client: &Arc<Client>, frame: Frame) -> Outcome {
        if !client.is_connected() {
            return self.handle_connect(client, frame);
        }

        let frame_type = match FrameType::from_i32(frame.frame_type) {
            Ok(ty) => ty,
            Err(err) => {
                self.reply_err(client, frame.id, FrameType::ChCommand, DispatchError::Protocol(err));
                return Outcome::Continue;
            }
        };

        match frame_type {
            FrameType::SvrDisconnect => Outcome::Disconnect,
            FrameType::ChConnect => {
                self.handle_ch_connect(client, &frame);
                Outcome::Continue
            }
            FrameType::ChDisconnect => {
                self.handle_ch_disconnect(client, &frame);
                Outcome::Continue
            }
            FrameType::ChMessage => {
                self.handle_ch_message(client, &frame);
                Outcome::Continue
            }
            FrameType::ChCommand => {
                self.handle_ch_command(client, &frame);
                Outcome::Continue
            }
            // SVR_CONNECT while already connected, and the server-only SVR_MESSAGE/CH_DESTROY
            // types, are all protocol errors when sent by a connected client.
            other => {
                self.reply_err(client, frame.id, other, DispatchError::Protocol(ProtocolError::InvalidField));
                Outcome::Continue
            }
        }
    }

    fn handle_connect(&self, client: &Arc<Client>, frame: Frame) -> Outcome {
        if FrameType::from_i32(frame.frame_type) != Ok(FrameType::SvrConnect) {
            client.send(&Frame::new(ERR_PROTOCOL, FrameType::SvrConnect, Vec::new()));
            return Outcome::Continue;
        }
        match client.connect(&frame.payload) {
            Ok(display_name) => {
                slog::info!(self.log, "client connected"; "client_id" => client.id(), "name" => &display_name);
                client.send(&Frame::new(frame.id, FrameType::SvrConnect, display_name.into_bytes()));
            }
            Err(_) => {
                client.send(&Frame::new(ERR_PROTOCOL, FrameType::SvrConnect, Vec::new()));
            }
        }
        Outcome::Continue
    }

    fn handle_ch_connect(&self, client: &Arc<Client>, frame: &Frame) {
        let mut cursor = Cursor::new(&frame.payload);
        let flag = match cursor.read_u8() {
            Ok(v) => v,
            Err(_) => return self.reply_err(client, frame.id, FrameType::ChConnect, DispatchError::Protocol(ProtocolError::InvalidField)),
        };
        let channel_id = match cursor.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => return self.reply_err(client, frame.id, FrameType::ChConnect, DispatchError::Protocol(ProtocolError::InvalidField)),
        };
        // Any remaining bytes are the optional invite token (spec.md §6); parsed and
        // ignored, since secrecy is enforced by the registry-side invitation set keyed by
        // client id rather than a bearer token (SPEC_FULL.md §4.6).

        match self.channels.find(channel_id) {
            Some(channel) => match channel.enter(client.id()) {
                Ok(()) => {
                    client.join(channel_id);
                    client.send(&Frame::new(frame.id, FrameType::ChConnect, channel.info_bytes()));
                }
                Err(err) => self.reply_err(client, frame.id, FrameType::ChConnect, err.into()),
            },
            None if flag == 1 => {
                if self.channels.is_at_capacity() {
                    return self.reply_err(client, frame.id, FrameType::ChConnect, DispatchError::Capacity);
                }
                match self.channels.create(channel_id, client) {
                    Ok(channel) => {
                        slog::info!(self.log, "channel created"; "channel_id" => channel_id, "client_id" => client.id());
                        client.send(&Frame::new(frame.id, FrameType::ChConnect, channel.info_bytes()));
                    }
                    Err(err) => self.reply_err(client, frame.id, FrameType::ChConnect, err.into()),
                }
            }
            None => self.reply_err(client, frame.id, FrameType::ChConnect, DispatchError::NotFound),
        }
    }

    fn handle_ch_disconnect(&self, client: &Arc<Client>, frame: &Frame) {
        let channel_id = match read_u32(&frame.payload, 0) {
            Some(v) => v,
            None => return self.reply_err(client, frame.id, FrameType::ChDisconnect, DispatchError::Protocol(ProtocolError::InvalidField)),
        };
        let channel = match self.channels.find(channel_id) {
            Some(c) => c,
            None => return self.reply_err(client, frame.id, FrameType::ChDisconnect, DispatchError::NotFound),
        };
        let outcome = channel.leave(client.id());
        self.leave_channel_with_outcome(&channel, client.id(), outcome);
        client.send(&Frame::new(frame.id, FrameType::ChDisconnect, Vec::new()));
    }

    fn handle_ch_message(&self, client: &Arc<Client>, frame: &Frame) {
        let channel_id = match read_u32(&frame.payload, 0) {
            Some(v) => v,
            None => return self.reply_err(client, frame.id, FrameType::ChMessage, DispatchError::Protocol(ProtocolError::InvalidField)),
        };
        let text = match std::str::from_utf8(&frame.payload[4.min(frame.payload.len())..]) {
            Ok(text) => text,
            Err(_) => return self.reply_err(client, frame.id, FrameType::ChMessage, DispatchError::Protocol(ProtocolError::InvalidField)),
        };
        let channel = match self.channels.find(channel_id) {
            Some(c) => c,
            None => return self.reply_err(client, frame.id, FrameType::ChMessage, DispatchError::NotFound),
        };
        if !channel.is_member(client.id()) {
            return self.reply_err(client, frame.id, FrameType::ChMessage, DispatchError::NotFound);
        }
        client.send(&Frame::new(frame.id, FrameType::ChMessage, Vec::new()));
        if channel.send_message(client.id(), text) {
            self.schedule_drain(channel);
        }
    }

    fn handle_ch_command(&self, client: &Arc<Client>, frame: &Frame) {
        let mut cursor = Cursor::new(&frame.payload);
        let cmd = match cursor.read_u8().ok().and_then(|b| CommandCode::from_u8(b).ok()) {
            Some(cmd) => cmd,
            None => return self.reply_err(client, frame.id, FrameType::ChCommand, DispatchError::Protocol(ProtocolError::InvalidField)),
        };
        let channel_id = match cursor.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => return self.reply_err(client, frame.id, FrameType::ChCommand, DispatchError::Protocol(ProtocolError::InvalidField)),
        };
        let mut arg = Vec::new();
        let _ = cursor.read_to_end(&mut arg);

        let channel = match self.channels.find(channel_id) {
            Some(c) => c,
            None => return self.reply_err(client, frame.id, FrameType::ChCommand, DispatchError::NotFound),
        };
        if !channel.is_member(client.id()) {
            return self.reply_err(client, frame.id, FrameType::ChCommand, DispatchError::NotFound);
        }

        let result = self.run_command(client, &channel, cmd, &arg);
        match result {
            Ok(()) => client.send(&Frame::new(frame.id, FrameType::ChCommand, Vec::new())),
            Err(err) => self.reply_err(client, frame.id, FrameType::ChCommand, err),
        }
    }

    fn run_command(&self, client: &Arc<Client>, channel: &Arc<Channel>, cmd: CommandCode, arg: &[u8]) -> Result<(), DispatchError> {
        match cmd {
            CommandCode::Rename => {
                let new_name = std::str::from_utf8(arg).map_err(|_| DispatchError::Protocol(ProtocolError::InvalidField))?;
                if channel.rename(client.id(), new_name)? {
                    self.schedule_drain(channel.clone());
                }
                Ok(())
            }
            CommandCode::Pin => {
                let text = std::str::from_utf8(arg).map_err(|_| DispatchError::Protocol(ProtocolError::InvalidField))?;
                if channel.pin_message(client.id(), text)? {
                    self.schedule_drain(channel.clone());
                }
                Ok(())
            }
            // PROMOTE_EMPEROR: hand the emperorship to an existing moderator
            // (`Channel::promote_moderator`, spec.md §4.3).
            CommandCode::PromoteEmperor => {
                let target = read_u32(arg, 0).ok_or(DispatchError::Protocol(ProtocolError::InvalidField))?;
                channel.promote_moderator(client.id(), target as u64)?;
                Ok(())
            }
            // PROMOTE_MOD: elevate a member to moderator (`Channel::promote_member`).
            CommandCode::PromoteMod => {
                let target = read_u32(arg, 0).ok_or(DispatchError::Protocol(ProtocolError::InvalidField))?;
                channel.promote_member(client.id(), target as u64)?;
                Ok(())
            }
            CommandCode::Kick => {
                let target_id = read_u32(arg, 0).ok_or(DispatchError::Protocol(ProtocolError::InvalidField))? as u64;
                let outcome = channel.kick(client.id(), target_id)?;
                self.leave_channel_with_outcome(channel, target_id, outcome);
                Ok(())
            }
            CommandCode::Invite => {
                let target_id = read_u32(arg, 0).ok_or(DispatchError::Protocol(ProtocolError::InvalidField))? as u64;
                let target_exists = self.clients.find(target_id).is_some();
                channel.invite(client.id(), target_id, target_exists)?;
                Ok(())
            }
            CommandCode::Privacy => {
                channel.change_privacy(client.id())?;
                Ok(())
            }
        }
    }

    /// Applies a `Channel::leave`/`Channel::kick` outcome: the client-side/registry-side
    /// bookkeeping the channel itself cannot do, since it only knows ids, never `Arc<Client>`
    /// (spec.md §9 cyclic references — the dispatcher is what resolves ids against the
    /// client registry).
    fn leave_channel_with_outcome(&self, channel: &Arc<Channel>, target_id: u64, outcome: LeaveOutcome) {
        if let Some(target) = self.clients.find(target_id) {
            target.leave(channel.id());
        }
        match outcome {
            LeaveOutcome::Survived { promoted_emperor } => {
                if promoted_emperor.is_some() {
                    self.schedule_drain(channel.clone());
                }
            }
            LeaveOutcome::Destroyed { remaining_members } => {
                self.channels.drop(channel.id());
                slog::info!(self.log, "channel destroyed, no successor"; "channel_id" => channel.id());
                for member_id in remaining_members {
                    if let Some(member) = self.clients.find(member_id) {
                        member.leave(channel.id());
                    }
                }
                self.schedule_drain(channel.clone());
            }
        }
    }

    /// Runs the full disconnect sweep for `client` (spec.md §3 Client destruction, §5
    /// resource safety). Idempotent: a client with an already-empty joined set and already
    /// absent from the registry is a no-op (Testable Property 7).
    pub fn disconnect(&self, client: &Arc<Client>) {
        for channel_id in client.joined_channels() {
            if let Some(channel) = self.channels.find(channel_id) {
                let outcome = channel.leave(client.id());
                self.leave_channel_with_outcome(&channel, client.id(), outcome);
            }
        }
        self.clients.remove(client.id());
        slog::info!(self.log, "client disconnected"; "client_id" => client.id());
    }

    fn schedule_drain(&self, channel: Arc<Channel>) {
        let clients = Arc::clone(&self.clients);
        let log = self.log.new(o!("channel_id" => channel.id()));
        self.workers.execute(move || {
            for frame in channel.drain_broadcasts() {
                let members = channel.member_snapshot();
                for member_id in members {
                    if let Some(client) = clients.find(member_id) {
                        client.send(&frame);
                        if client.is_poisoned() {
                            slog::debug!(log, "broadcast send failed, client will be reaped"; "client_id" => member_id);
                        }
                    }
                }
            }
        });
    }

    fn reply_err(&self, client: &Arc<Client>, _req_id: i32, frame_type: FrameType, err: DispatchError) {
        client.send(&Frame::new(err.response_id(), frame_type, Vec::new()));
    }
}

fn read_u32(payload: &[u8], offset: usize) -> Option<u32> {
    let mut cursor = Cursor::new(payload.get(offset..offset + 4)?);
    cursor.read_u32::<LittleEndian>().ok()
}
