use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::callbacks::{CallbackRegistry, FileHandle, FileStorage, HostError};
use super::config::{Config, MAX_RETRIES};
use super::dispatcher::Dispatcher;
use super::scheduler;
use super::section::{SectionEnv, SectionId, SectionInfo, SectionStatus};
use super::table::SectionTable;

/// Failure of a server-level operation
#[derive(Debug, thiserror::Error)]
pub enum TftpdError {
    #[error("server is already listening on {0}")]
    AlreadyListening(SocketAddr),
    #[error("server is not listening")]
    NotListening,
    #[error("cannot change the {0} while listening")]
    ConfigWhileListening(&'static str),
    #[error("server timeout must be greater than zero")]
    InvalidTimeout,
    #[error("idle timeout must be greater than zero")]
    InvalidIdleTimeout,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// `destroy` was called on a listening server, which is handed back
#[derive(Debug, thiserror::Error)]
#[error("cannot destroy a server that is still listening")]
pub struct DestroyError {
    pub server: Server,
}

/// Most recent error message of a server
#[derive(Debug, Default)]
pub(crate) struct LastError {
    message: Mutex<Option<String>>,
}

impl LastError {
    pub fn record(&self, message: impl Into<String>) {
        *self.message.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    pub fn get(&self) -> Option<String> {
        self.message.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Read-only view of the sections of a server
///
/// Cheap to clone and safe to use from inside callbacks.
#[derive(Debug, Clone)]
pub struct SectionView {
    table: Arc<SectionTable>,
}

impl SectionView {
    /// Id of the section serving `client`
    pub fn get_section_id(&self, client: SocketAddr) -> Option<SectionId> {
        self.table.id_for(client)
    }

    /// `Undefined` for ids that never existed or were already removed
    pub fn get_section_status(&self, id: SectionId) -> SectionStatus {
        self.table.status(id)
    }

    pub fn get_client_ip(&self, id: SectionId) -> Option<IpAddr> {
        self.table.info(id).map(|info| info.client.ip())
    }

    pub fn section_info(&self, id: SectionId) -> Option<SectionInfo> {
        self.table.info(id)
    }

    /// Number of live sections
    pub fn active_sections(&self) -> usize {
        self.table.len()
    }
}

#[derive(Debug)]
struct Listener {
    local_addr: SocketAddr,
    /// Set by `stop_listening`, or by the dispatcher when the server idles out
    shutdown: Arc<watch::Sender<bool>>,
    dispatcher: JoinHandle<()>,
    scheduler: JoinHandle<()>,
}

impl Listener {
    fn is_running(&self) -> bool {
        !*self.shutdown.borrow()
    }

    /// Signal both tasks and wait for them
    async fn join(self) {
        self.shutdown.send_replace(true);
        if let Err(err) = self.dispatcher.await {
            log::error!("Dispatcher task failed: {}", err);
        }
        if let Err(err) = self.scheduler.await {
            log::error!("Scheduler task failed: {}", err);
        }
        log::info!("TFTP server on {} stopped", self.local_addr);
    }
}

/// TFTP daemon handle
///
/// Owns the configuration, the callback table and the section table. Several
/// independent servers may exist in one process.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rtftpd::tftp::server::{Config, DirectoryStorage, Server};
///
/// # async fn demo() -> anyhow::Result<()> {
/// let mut server = Server::with_config(Config::new("0.0.0.0".parse()?, 6969));
/// server.register_storage(Arc::new(DirectoryStorage::new("/srv/tftp")));
/// let addr = server.start_listening().await?;
/// println!("listening on {}", addr);
/// server.stop_listening().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Server {
    config: Config,
    registry: Arc<CallbackRegistry>,
    table: Arc<SectionTable>,
    errors: Arc<LastError>,
    listener: Option<Listener>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Server on the default port with the default timeout
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            registry: Arc::new(CallbackRegistry::new()),
            table: Arc::new(SectionTable::new()),
            errors: Arc::new(LastError::default()),
            listener: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Free the server
    ///
    /// A listening server is returned inside the error untouched.
    pub fn destroy(self) -> Result<(), DestroyError> {
        if self.is_listening() {
            self.errors.record("Cannot destroy a server that is still listening");
            return Err(DestroyError { server: self });
        }
        let released = self.table.clear();
        log::debug!("Server destroyed, {} section(s) released", released);
        Ok(())
    }

    pub fn set_port(&mut self, port: u16) -> Result<(), TftpdError> {
        if self.is_listening() {
            return Err(self.reject(TftpdError::ConfigWhileListening("port")));
        }
        self.config.port = port;
        Ok(())
    }

    /// Set the ack timeout used by sections started afterwards
    pub fn set_server_timeout(&mut self, timeout: Duration) -> Result<(), TftpdError> {
        if self.is_listening() {
            return Err(self.reject(TftpdError::ConfigWhileListening("timeout")));
        }
        if timeout.is_zero() {
            return Err(self.reject(TftpdError::InvalidTimeout));
        }
        self.config.timeout = timeout;
        Ok(())
    }

    /// Stop listening after this long without a request; `None` never stops
    pub fn set_idle_timeout(&mut self, idle_timeout: Option<Duration>) -> Result<(), TftpdError> {
        if self.is_listening() {
            return Err(self.reject(TftpdError::ConfigWhileListening("idle timeout")));
        }
        if idle_timeout.is_some_and(|idle| idle.is_zero()) {
            return Err(self.reject(TftpdError::InvalidIdleTimeout));
        }
        self.config.idle_timeout = idle_timeout;
        Ok(())
    }

    pub fn register_open_file_callback<F>(&self, callback: F)
    where
        F: Fn(&SectionInfo) -> Result<FileHandle, HostError> + Send + Sync + 'static,
    {
        self.registry.register_open_file_callback(callback);
    }

    pub fn register_close_file_callback<F>(&self, callback: F)
    where
        F: Fn(SectionId, FileHandle) -> Result<(), HostError> + Send + Sync + 'static,
    {
        self.registry.register_close_file_callback(callback);
    }

    pub fn register_section_started_callback<F>(&self, callback: F)
    where
        F: Fn(SectionId) + Send + Sync + 'static,
    {
        self.registry.register_section_started_callback(callback);
    }

    pub fn register_section_finished_callback<F>(&self, callback: F)
    where
        F: Fn(SectionId, SectionStatus) + Send + Sync + 'static,
    {
        self.registry.register_section_finished_callback(callback);
    }

    /// Install the open and close callbacks of `storage`
    pub fn register_storage<S>(&self, storage: Arc<S>)
    where
        S: FileStorage + 'static,
    {
        self.registry.register_storage(storage);
    }

    /// `false` once stopped, including after an idle timeout
    pub fn is_listening(&self) -> bool {
        self.running().is_some()
    }

    /// Address the socket is bound to, while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running().map(|listener| listener.local_addr)
    }

    /// Resolves once the server stops listening, either through an idle
    /// timeout or `stop_listening`; immediately if it is not listening
    pub async fn closed(&self) {
        let Some(listener) = &self.listener else {
            return;
        };
        let mut signal = listener.shutdown.subscribe();
        let _ = signal.wait_for(|stopped| *stopped).await;
    }

    /// Bind the socket and start serving
    pub async fn start_listening(&mut self) -> Result<SocketAddr, TftpdError> {
        if let Some(listener) = self.running() {
            return Err(self.reject(TftpdError::AlreadyListening(listener.local_addr)));
        }
        if let Some(idled_out) = self.listener.take() {
            idled_out.join().await;
        }

        let addr = SocketAddr::new(self.config.ip_address, self.config.port);
        let socket = match UdpSocket::bind(addr).await {
            Ok(socket) => socket,
            Err(source) => return Err(self.reject(TftpdError::Bind { addr, source })),
        };
        let local_addr = match socket.local_addr() {
            Ok(local_addr) => local_addr,
            Err(source) => return Err(self.reject(TftpdError::Bind { addr, source })),
        };

        let socket = Arc::new(socket);
        let (shutdown, signal) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let env = SectionEnv {
            table: Arc::clone(&self.table),
            errors: Arc::clone(&self.errors),
            timeout: self.config.timeout,
            max_retries: MAX_RETRIES,
        };
        let dispatcher = Dispatcher::new(
            socket,
            Arc::clone(&self.registry),
            env,
            self.config.max_sections,
            Arc::clone(&shutdown),
        )
        .with_idle_timeout(self.config.idle_timeout);
        let dispatcher = tokio::spawn(dispatcher.run(signal.clone()));
        let scheduler = tokio::spawn(scheduler::run(Arc::clone(&self.table), self.config.timeout, signal));

        log::info!(
            "TFTP server listening on {} (timeout {:?}, idle timeout {:?}, max {} sections)",
            local_addr,
            self.config.timeout,
            self.config.idle_timeout,
            self.config.max_sections
        );
        self.listener = Some(Listener {
            local_addr,
            shutdown,
            dispatcher,
            scheduler,
        });
        Ok(local_addr)
    }

    /// Stop accepting requests and terminate every section
    ///
    /// Running sections end with an ERROR to their client and report
    /// `SectionStatus::Error`; this returns once all of them are gone. A
    /// server that already idled out reports `NotListening`.
    pub async fn stop_listening(&mut self) -> Result<(), TftpdError> {
        let Some(listener) = self.listener.take() else {
            return Err(self.reject(TftpdError::NotListening));
        };
        let was_running = listener.is_running();
        listener.join().await;
        if !was_running {
            return Err(self.reject(TftpdError::NotListening));
        }
        Ok(())
    }

    fn running(&self) -> Option<&Listener> {
        self.listener.as_ref().filter(|listener| listener.is_running())
    }

    pub fn section_view(&self) -> SectionView {
        SectionView {
            table: Arc::clone(&self.table),
        }
    }

    pub fn get_section_id(&self, client: SocketAddr) -> Option<SectionId> {
        self.table.id_for(client)
    }

    pub fn get_section_status(&self, id: SectionId) -> SectionStatus {
        self.table.status(id)
    }

    pub fn get_client_ip(&self, id: SectionId) -> Option<IpAddr> {
        self.section_view().get_client_ip(id)
    }

    pub fn section_info(&self, id: SectionId) -> Option<SectionInfo> {
        self.table.info(id)
    }

    pub fn active_sections(&self) -> usize {
        self.table.len()
    }

    /// Most recent error recorded by the server or one of its sections
    pub fn get_error_msg(&self) -> Option<String> {
        self.errors.get()
    }

    pub fn set_error_msg(&self, message: impl Into<String>) {
        self.errors.record(message);
    }

    fn reject(&self, err: TftpdError) -> TftpdError {
        log::warn!("{}", err);
        self.errors.record(err.to_string());
        err
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Tasks wind down on their own once signalled
        if let Some(listener) = self.listener.take() {
            listener.shutdown.send_replace(true);
        }
    }
}
