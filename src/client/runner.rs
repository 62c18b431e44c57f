//! Client main loop: probe, connect, render, reconnect

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::util::time::{unix_millis, unix_millis_f64, Timer};
use crate::ws::protocol::{ClientMsg, ServerMsg};

use super::mode::{heading, Action, Mode, ModeController, LOCAL_PLAYER_ID};
use super::probe::{HealthProbe, ProbeError};
use super::replica::RenderPose;
use super::transport::{Transport, TransportError};

/// Render frames per second of the headless loop
const FRAME_RATE: u32 = 60;
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Source of the normalized 2-axis control signal
pub trait InputSource {
    /// `(steer, throttle)`, both in `[-1, 1]`
    fn sample(&mut self, elapsed: Duration) -> (f32, f32);
}

/// Drives in slow weaving circles
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptedInput;

impl InputSource for ScriptedInput {
    fn sample(&mut self, elapsed: Duration) -> (f32, f32) {
        let t = elapsed.as_secs_f32();
        let steer = (t * 0.4).sin() * 0.6;
        // Brief reverse every 10 s
        let throttle = if t % 10.0 > 8.5 { -0.6 } else { 0.8 };
        (steer, throttle)
    }
}

/// Why a background connect attempt failed
#[derive(Debug, thiserror::Error)]
enum ConnectFailure {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Connect task failed: {0}")]
    Task(#[from] JoinError),
}

type ConnectTask = JoinHandle<Result<Transport, ConnectFailure>>;

enum Event {
    Frame,
    SendInput,
    Message(Result<ServerMsg, TransportError>),
    Connected(Result<Result<Transport, ConnectFailure>, JoinError>),
    Status,
    Shutdown,
}

async fn recv(transport: &mut Option<Transport>) -> Result<ServerMsg, TransportError> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn connected(
    task: &mut Option<ConnectTask>,
) -> Result<Result<Transport, ConnectFailure>, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

/// Probe, then open the socket. Each stage is bounded by `limit`.
async fn open_session(
    probe: HealthProbe,
    url: String,
    limit: Duration,
) -> Result<Transport, ConnectFailure> {
    probe.check().await?;
    let transport = Transport::connect_within(&url, limit).await?;
    info!(url = %url, "Transport open, waiting for welcome");
    Ok(transport)
}

/// Client state owned by the loop
pub struct ClientRunner<I> {
    config: ClientConfig,
    probe: HealthProbe,
    controller: ModeController,
    transport: Option<Transport>,
    connecting: Option<ConnectTask>,
    /// Transport must deliver a welcome before this
    welcome_deadline: Option<Instant>,
    input: I,
    seq: u32,
    last_poses: Vec<RenderPose>,
}

impl<I: InputSource> ClientRunner<I> {
    pub fn new(config: ClientConfig, input: I) -> Result<Self, ProbeError> {
        let probe = HealthProbe::new(config.health_url(), config.probe_timeout)?;
        let controller = ModeController::new(&config);
        Ok(Self {
            config,
            probe,
            controller,
            transport: None,
            connecting: None,
            welcome_deadline: None,
            input,
            seq: 0,
            last_poses: Vec::new(),
        })
    }

    pub fn controller(&self) -> &ModeController {
        &self.controller
    }

    /// Start a connect attempt in the background. The loop keeps rendering
    /// while it runs.
    fn start_connect(&mut self) {
        if self.connecting.is_some() || self.transport.is_some() {
            return;
        }
        self.controller.begin_connect();
        debug!(url = %self.probe.url(), "Probing host");
        self.connecting = Some(tokio::spawn(open_session(
            self.probe.clone(),
            self.config.ws_url(),
            self.config.probe_timeout,
        )));
    }

    /// Any failure means offline
    fn finish_connect(&mut self, result: Result<Result<Transport, ConnectFailure>, JoinError>) {
        self.connecting = None;
        let now = Instant::now();
        match result.map_err(ConnectFailure::from).and_then(|r| r) {
            Ok(transport) => {
                self.transport = Some(transport);
                self.welcome_deadline = Some(now + self.config.probe_timeout);
            }
            Err(ConnectFailure::Probe(e)) => {
                self.controller.enter_offline(e.to_string(), now);
            }
            Err(e) => {
                self.controller.on_transport_closed(e.to_string(), now);
            }
        }
    }

    async fn drop_transport(&mut self, reason: String) {
        self.welcome_deadline = None;
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.controller.on_transport_closed(reason, Instant::now());
    }

    /// Give up on a transport that never delivered its welcome
    async fn check_welcome(&mut self, now: Instant) {
        let Some(deadline) = self.welcome_deadline else {
            return;
        };
        if self.controller.mode() == Mode::Online {
            self.welcome_deadline = None;
        } else if now >= deadline {
            warn!("Host sent no welcome in time");
            self.drop_transport("no welcome from host".to_string()).await;
        }
    }

    async fn send(&mut self, msg: ClientMsg) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Err(e) = transport.send(&msg).await {
            warn!(error = %e, "Send failed");
            self.drop_transport(e.to_string()).await;
        }
    }

    /// Run until `shutdown` changes
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(host = %self.config.host_url, "Client starting");
        self.start_connect();

        let started = Instant::now();
        let mut frame_timer = Timer::new();
        let mut frames = interval(Duration::from_secs_f64(1.0 / FRAME_RATE as f64));
        frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut inputs = interval(Duration::from_secs_f64(
            1.0 / self.config.input_rate as f64,
        ));
        inputs.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status = interval(STATUS_INTERVAL);

        loop {
            let event = tokio::select! {
                _ = frames.tick() => Event::Frame,
                _ = inputs.tick() => Event::SendInput,
                msg = recv(&mut self.transport) => Event::Message(msg),
                result = connected(&mut self.connecting) => Event::Connected(result),
                _ = status.tick() => Event::Status,
                _ = shutdown.changed() => Event::Shutdown,
            };

            match event {
                Event::Frame => {
                    let (steer, throttle) = self.input.sample(started.elapsed());
                    self.last_poses = self.controller.frame(
                        frame_timer.lap(),
                        steer,
                        throttle,
                        unix_millis_f64(),
                    );
                    let now = Instant::now();
                    self.check_welcome(now).await;
                    if self.controller.poll_reconnect(now) == Action::Connect {
                        debug!("Reconnect timer fired");
                        self.start_connect();
                    }
                }
                Event::SendInput => {
                    if self.controller.mode() != Mode::Online {
                        continue;
                    }
                    let (steer, throttle) = self.input.sample(started.elapsed());
                    self.seq = self.seq.wrapping_add(1);
                    let msg = ClientMsg::Input {
                        steer,
                        throttle,
                        brake: throttle < 0.0,
                        seq: self.seq,
                        t: unix_millis(),
                    };
                    self.send(msg).await;
                }
                Event::Message(Ok(msg)) => {
                    if let Action::Reply(reply) =
                        self.controller.on_server_msg(msg, unix_millis_f64())
                    {
                        self.send(reply).await;
                    }
                }
                Event::Message(Err(e)) => {
                    self.drop_transport(e.to_string()).await;
                }
                Event::Connected(result) => self.finish_connect(result),
                Event::Status => {
                    if self.controller.mode() == Mode::Online {
                        self.send(ClientMsg::Ping { t: unix_millis() }).await;
                    }
                    self.log_status();
                }
                Event::Shutdown => break,
            }
        }

        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        info!(status = %self.controller.status(), "Client stopped");
    }

    fn log_status(&self) {
        let status = self.controller.status();
        let player_id = self.controller.local_id().unwrap_or(LOCAL_PLAYER_ID);
        let player = self.last_poses.iter().find(|p| p.id == player_id);

        match player {
            Some(pose) => info!(
                status = %status,
                entities = self.last_poses.len(),
                x = pose.position.x,
                z = pose.position.z,
                heading = heading(pose.orientation),
                speed = pose.speed,
                "Client status"
            ),
            None => info!(
                status = %status,
                entities = self.last_poses.len(),
                "Client status"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::routes::HealthResponse;
    use axum::extract::ws::WebSocketUpgrade;
    use axum::routing::get;
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    #[test]
    fn scripted_input_stays_normalized() {
        let mut input = ScriptedInput;
        for ms in (0..30_000).step_by(250) {
            let (steer, throttle) = input.sample(Duration::from_millis(ms));
            assert!((-1.0..=1.0).contains(&steer));
            assert!((-1.0..=1.0).contains(&throttle));
        }
        assert!(input.sample(Duration::from_millis(9_000)).1 < 0.0);
    }

    /// Host whose `/health` is fine but whose `/ws` never completes a session
    async fn stalled_host(upgrade: bool) -> String {
        let health = || async {
            Json(HealthResponse {
                ok: true,
                uptime_secs: 0,
                sessions: 0,
                tick: 0,
            })
        };
        let router = if upgrade {
            Router::new().route("/health", get(health)).route(
                "/ws",
                get(|ws: WebSocketUpgrade| async move {
                    ws.on_upgrade(|socket| async move {
                        let _held = socket;
                        std::future::pending::<()>().await;
                    })
                }),
            )
        } else {
            Router::new()
                .route("/health", get(health))
                .route("/ws", get(|| std::future::pending::<&'static str>()))
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    fn fast_config(host_url: String) -> ClientConfig {
        ClientConfig {
            host_url,
            probe_timeout: Duration::from_millis(300),
            offline_prop_count: 3,
            ..ClientConfig::default()
        }
    }

    /// Run the loop for `duration`, failing if it does not stop promptly
    async fn run_for(runner: &mut ClientRunner<ScriptedInput>, duration: Duration) {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(true);
        });
        tokio::time::timeout(duration + Duration::from_secs(3), runner.run(rx))
            .await
            .expect("client loop stalled");
    }

    #[tokio::test]
    async fn unreachable_host_runs_offline() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let mut runner =
            ClientRunner::new(fast_config(format!("http://{addr}")), ScriptedInput).unwrap();
        runner.start_connect();
        let task = runner.connecting.take().unwrap();
        runner.finish_connect(task.await);

        assert_eq!(runner.controller().mode(), Mode::Offline);
        assert_eq!(runner.controller().remote_entity_count(), 0);
        assert_eq!(runner.controller().local_world().unwrap().prop_count(), 3);
        assert!(runner.controller().reconnect_timer().is_armed());
    }

    #[tokio::test]
    async fn stalled_upgrade_falls_back_offline() {
        let host = stalled_host(false).await;
        let mut runner = ClientRunner::new(fast_config(host), ScriptedInput).unwrap();
        runner.start_connect();
        let task = runner.connecting.take().unwrap();
        let result = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("connect attempt never finished");
        runner.finish_connect(result);

        assert_eq!(runner.controller().mode(), Mode::Offline);
        assert!(runner.controller().status().reason.contains("timed out"));
        assert!(runner.controller().reconnect_timer().is_armed());
    }

    #[tokio::test]
    async fn offline_world_keeps_stepping_while_host_stalls() {
        let host = stalled_host(false).await;
        let mut runner = ClientRunner::new(fast_config(host), ScriptedInput).unwrap();
        run_for(&mut runner, Duration::from_millis(1_200)).await;

        assert_eq!(runner.controller().mode(), Mode::Offline);
        let local = runner.controller().local_world().unwrap();
        assert!(local.simulation().tick() > 0);
    }

    #[tokio::test]
    async fn missing_welcome_drops_the_transport() {
        let host = stalled_host(true).await;
        let mut runner = ClientRunner::new(fast_config(host), ScriptedInput).unwrap();
        run_for(&mut runner, Duration::from_millis(1_500)).await;

        assert_eq!(runner.controller().mode(), Mode::Offline);
        assert_eq!(runner.controller().status().reason, "no welcome from host");
        assert!(runner.transport.is_none());
    }
}
