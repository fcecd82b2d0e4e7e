use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Semaphore;
use tracing::info;

use spabook::config::Config;
use spabook::engine::Engine;
use spabook::model::{AppointmentStatus, Event};
use spabook::notify::{NotifyHub, Topic};
use spabook::{compactor, wire};

/// Log every new pending booking. The e-mail notifier hangs off this stream.
async fn run_booking_notifier(notify: Arc<NotifyHub>) {
    let mut rx = notify.subscribe(Topic::Appointments);
    loop {
        match rx.recv().await {
            Ok(Event::AppointmentCreated { appointment })
                if appointment.status == AppointmentStatus::Pending =>
            {
                info!(
                    "new booking request {} on {} at {}",
                    appointment.id, appointment.date, appointment.span
                );
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => tracing::warn!("booking notifier skipped {n} events"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    spabook::observability::init(config.metrics_port)?;

    let tls_acceptor =
        spabook::tls::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;
    if config.uses_default_passwords() {
        tracing::warn!("running with a default password; set SPABOOK_ADMIN_PASSWORD and SPABOOK_BOOKING_PASSWORD");
    }

    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(config.wal_path(), notify.clone())?);
    tokio::spawn(compactor::run_compactor(engine.clone(), config.compact_threshold));
    tokio::spawn(run_booking_notifier(notify));

    let factory = wire::SpabookFactory::new(
        engine,
        config.admin_password.clone(),
        config.booking_password.clone(),
    );
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("spabook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("cannot listen for SIGTERM: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(spabook::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(spabook::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(spabook::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let factory = factory.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, factory, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(spabook::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("spabook stopped");
    Ok(())
}
