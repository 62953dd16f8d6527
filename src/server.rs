use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, instrument, warn};

use crate::codec::CodecError;
use crate::commands::{Command, CommandKind};
use crate::config::Config;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::store::{Store, StoreOptions};
use crate::Error;

/// Which listener accepted a connection. Restricted commands are only served on the admin
/// port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Main,
    Admin,
}

/// Settings every connection shares.
#[derive(Debug)]
struct Access {
    requirepass: Option<String>,
    restricted: HashSet<CommandKind>,
}

pub async fn run(config: Config) -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let listener = TcpListener::bind((config.bind.as_str(), config.port)).await?;
    let admin = match config.admin_port {
        Some(port) => Some(TcpListener::bind((config.bind.as_str(), port)).await?),
        None => None,
    };

    let store = Store::start(StoreOptions::from(&config));
    let access = Arc::new(Access {
        requirepass: config.requirepass.clone(),
        restricted: config.restricted(),
    });

    info!("Redis server listening on {}", listener.local_addr()?);

    match admin {
        Some(admin) => {
            info!("Admin listener on {}", admin.local_addr()?);
            tokio::try_join!(
                accept(listener, Role::Main, store.clone(), access.clone()),
                accept(admin, Role::Admin, store.clone(), access.clone()),
            )?;
        }
        None => accept(listener, Role::Main, store.clone(), access.clone()).await?,
    }

    store.shutdown();
    Ok(())
}

async fn accept(
    listener: TcpListener,
    role: Role,
    store: Store,
    access: Arc<Access>,
) -> Result<(), Error> {
    loop {
        let (socket, client_address) = listener.accept().await?;
        let store = store.clone();
        let access = access.clone();
        info!(?role, "Accepted connection from {:?}", client_address);

        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, client_address, role, store, access).await {
                error!(error = %e, "Connection failed");
            }
        });
    }
}

#[instrument(
    name = "connection",
    skip(stream, store, access),
    fields(connection_id, client_address)
)]
async fn handle_connection(
    stream: TcpStream,
    client_address: SocketAddr,
    role: Role,
    store: Store,
    access: Arc<Access>,
) -> Result<(), Error> {
    let mut conn = Connection::new(stream);

    tracing::Span::current()
        .record("connection_id", conn.id.to_string())
        .record("client_address", client_address.to_string());

    let mut session = Session::new(role, access);

    loop {
        let frame = match conn.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(CodecError::Io(err)) => return Err(err.into()),
            Err(err) => {
                // The stream is out of sync after a malformed frame, so the connection is closed.
                warn!(error = %err, "Protocol error");
                let reply = Frame::Error(format!("ERR Protocol error: {}", err));
                conn.write_frame(&reply, store.memory()).await?;
                break;
            }
        };

        debug!("Received frame from client: {:?}", frame);
        let reply = session.handle(frame, &store).await;
        debug!("Sending response to client: {:?}", reply);

        conn.write_frame(&reply, store.memory()).await?;
    }

    info!("Connection closed");
    Ok(())
}

/// Per connection state: authentication and the commands queued by MULTI.
#[derive(Debug)]
struct Session {
    role: Role,
    access: Arc<Access>,
    authenticated: bool,
    queued: Option<Vec<Command>>,
    dirty: bool,
}

impl Session {
    fn new(role: Role, access: Arc<Access>) -> Session {
        Session {
            role,
            authenticated: access.requirepass.is_none(),
            access,
            queued: None,
            dirty: false,
        }
    }

    async fn handle(&mut self, frame: Frame, store: &Store) -> Frame {
        let kind = CommandKind::peek(&frame);

        if !self.authenticated && kind != Some(CommandKind::Auth) {
            return Frame::Error("NOAUTH Authentication required.".to_string());
        }

        if let Some(kind) = kind {
            if self.role == Role::Main && self.access.restricted.contains(&kind.canonical()) {
                self.dirty |= self.queued.is_some();
                return Frame::Error(format!(
                    "NOPERM this user has no permissions to run the '{}' command",
                    kind
                ));
            }
        }

        let command = match Command::try_from(frame) {
            Ok(command) => command,
            Err(err) => {
                self.dirty |= self.queued.is_some();
                return Frame::Error(format!("ERR {}", err));
            }
        };

        match command {
            Command::Auth(auth) => match &self.access.requirepass {
                None => Frame::Error(
                    "ERR AUTH <password> called without any password configured for the \
                     default user. Are you sure your configuration is correct?"
                        .to_string(),
                ),
                Some(password) if auth.matches(password) => {
                    self.authenticated = true;
                    Frame::ok()
                }
                Some(_) => Frame::Error(
                    "WRONGPASS invalid username-password pair or user is disabled.".to_string(),
                ),
            },
            Command::Multi(_) => {
                if self.queued.is_some() {
                    return Frame::Error("ERR MULTI calls can not be nested".to_string());
                }
                self.queued = Some(Vec::new());
                self.dirty = false;
                Frame::ok()
            }
            Command::Exec(_) => {
                let Some(commands) = self.queued.take() else {
                    return Frame::Error("ERR EXEC without MULTI".to_string());
                };
                if std::mem::take(&mut self.dirty) {
                    return Frame::Error(
                        "EXECABORT Transaction discarded because of previous errors.".to_string(),
                    );
                }
                store.submit_multi(commands).await
            }
            Command::Discard(_) => match self.queued.take() {
                Some(_) => {
                    self.dirty = false;
                    Frame::ok()
                }
                None => Frame::Error("ERR DISCARD without MULTI".to_string()),
            },
            command => match &mut self.queued {
                Some(queued) => {
                    queued.push(command);
                    Frame::Simple("QUEUED".to_string())
                }
                None => store.submit(command).await,
            },
        }
    }
}
