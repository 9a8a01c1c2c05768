//! Session Service
//!
//! Runs a [`SessionController`] on its own task. The task is the only code
//! that touches the controller; UI code sends commands through a cloneable
//! [`SessionHandle`] and reads events and snapshots from channels.

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::room::{GameMode, Room};
use super::session::{SessionController, SessionError, SessionEvent, SessionSnapshot};

const COMMAND_CAPACITY: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Requests from handles to the actor.
enum Command {
    CreateRoom {
        name: String,
        password: Option<String>,
        mode: GameMode,
        reply: Reply<Room>,
    },
    JoinRoom {
        room: Room,
        password: Option<String>,
        reply: Reply<()>,
    },
    LeaveRoom {
        reply: oneshot::Sender<()>,
    },
    StartGame {
        reply: Reply<()>,
    },
    SetReady {
        ready: bool,
        reply: Reply<()>,
    },
    SendChat {
        text: String,
        reply: Reply<()>,
    },
}

/// Actor owning a session controller.
pub struct SessionService {
    controller: SessionController,
    commands: mpsc::Receiver<Command>,
}

impl SessionService {
    /// Start the actor and return a handle to it.
    ///
    /// The task leaves any room and stops once every handle is dropped.
    pub fn spawn(controller: SessionController) -> SessionHandle {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = SessionHandle {
            commands: tx,
            events: controller.event_sender(),
            snapshot: controller.watch(),
        };

        let service = Self {
            controller,
            commands: rx,
        };
        tokio::spawn(service.run());
        handle
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.controller.config().tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                inbound = self.controller.poll_channel(), if self.controller.has_channel() => match inbound {
                    Ok(Some(inbound)) => {
                        if let Err(e) = self.controller.handle_inbound(inbound).await {
                            warn!(error = %e, "Dispatch failed");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "Receive failed"),
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.controller.tick_timers().await {
                        warn!(error = %e, "Session timers failed");
                    }
                }
            }
        }

        self.controller.leave_room().await;
        info!("Session service stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        let ctl = &mut self.controller;
        // A dropped reply receiver only means the caller stopped waiting
        match command {
            Command::CreateRoom { name, password, mode, reply } => {
                let _ = reply.send(ctl.create_room(&name, password.as_deref(), mode).await);
            }
            Command::JoinRoom { room, password, reply } => {
                let _ = reply.send(ctl.join_room(&room, password.as_deref()).await);
            }
            Command::LeaveRoom { reply } => {
                ctl.leave_room().await;
                let _ = reply.send(());
            }
            Command::StartGame { reply } => {
                let _ = reply.send(ctl.start_game().await);
            }
            Command::SetReady { ready, reply } => {
                let _ = reply.send(ctl.set_ready(ready).await);
            }
            Command::SendChat { text, reply } => {
                let _ = reply.send(ctl.send_chat(&text).await);
            }
        }
    }
}

/// Cloneable handle to a running [`SessionService`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Subscribe to session events from now on.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Watch session snapshots.
    pub fn snapshot(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Host a room.
    pub async fn create_room(
        &self,
        name: impl Into<String>,
        password: Option<&str>,
        mode: GameMode,
    ) -> Result<Room, SessionError> {
        let name = name.into();
        let password = password.map(str::to_string);
        self.request(|reply| Command::CreateRoom { name, password, mode, reply }).await
    }

    /// Join a discovered room.
    pub async fn join_room(&self, room: Room, password: Option<&str>) -> Result<(), SessionError> {
        let password = password.map(str::to_string);
        self.request(|reply| Command::JoinRoom { room, password, reply }).await
    }

    /// Leave the current room. Always succeeds once the service is running.
    pub async fn leave_room(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::LeaveRoom { reply })
            .await
            .map_err(|_| SessionError::ServiceStopped)?;
        rx.await.map_err(|_| SessionError::ServiceStopped)
    }

    /// Start the game (host only).
    pub async fn start_game(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::StartGame { reply }).await
    }

    /// Set the local ready flag.
    pub async fn set_ready(&self, ready: bool) -> Result<(), SessionError> {
        self.request(|reply| Command::SetReady { ready, reply }).await
    }

    /// Send a chat line.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        self.request(|reply| Command::SendChat { text, reply }).await
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SessionError::ServiceStopped)?;
        rx.await.map_err(|_| SessionError::ServiceStopped)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::network::discovery::LocalDiscovery;
    use crate::network::session::{SessionContext, SessionState};
    use std::sync::Arc;
    use std::time::Duration;

    fn spawn_service() -> SessionHandle {
        let ctx = SessionContext::new(SessionConfig::loopback("alice"), Arc::new(LocalDiscovery::new()));
        SessionService::spawn(SessionController::new(ctx))
    }

    #[tokio::test]
    async fn test_create_and_leave() {
        let handle = spawn_service();
        let mut snapshot = handle.snapshot();

        let room = handle.create_room("Den", None, GameMode::Coop).await.unwrap();
        assert_eq!(room.players, 1);
        assert_eq!(snapshot.borrow_and_update().state, SessionState::Hosting);

        handle.leave_room().await.unwrap();
        assert_eq!(snapshot.borrow_and_update().state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_start_game_event() {
        let handle = spawn_service();
        let mut events = handle.events();
        handle.create_room("Den", None, GameMode::Race).await.unwrap();
        handle.start_game().await.unwrap();

        let level = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if let Ok(SessionEvent::GameStarting { level }) = events.recv().await {
                    return level;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(level, "level_1");

        handle.leave_room().await.unwrap();
    }

    #[tokio::test]
    async fn test_chat_requires_room() {
        let handle = spawn_service();
        assert!(matches!(handle.send_chat("hi").await, Err(SessionError::NotInRoom)));
    }
}
