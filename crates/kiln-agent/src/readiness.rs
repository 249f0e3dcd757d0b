use std::{fmt, sync::Arc, time::Duration};

type LinePredicate = dyn Fn(&str) -> bool + Send + Sync;

/// Decides when a `starting` server becomes `running`.
#[derive(Clone)]
pub enum ReadinessProbe {
    /// Ready once a stdout line satisfies the predicate.
    OutputMarker(Arc<LinePredicate>),
    /// Ready once `127.0.0.1:<port>` accepts TCP connections.
    ListeningPort,
}

impl ReadinessProbe {
    pub fn output_marker(pred: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self::OutputMarker(Arc::new(pred))
    }

    /// The vanilla/Paper/Forge banner: `Done (3.1s)! For help, type "help"`.
    pub fn minecraft() -> Self {
        Self::output_marker(is_minecraft_done_line)
    }

    pub(crate) fn matches_line(&self, line: &str) -> bool {
        match self {
            Self::OutputMarker(pred) => pred(line),
            Self::ListeningPort => false,
        }
    }
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self::minecraft()
    }
}

impl fmt::Debug for ReadinessProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutputMarker(_) => f.write_str("OutputMarker(..)"),
            Self::ListeningPort => f.write_str("ListeningPort"),
        }
    }
}

pub fn is_minecraft_done_line(line: &str) -> bool {
    line.contains("Done (") && line.contains("For help, type \"help\"")
}

/// Poll until something listens on `port`, or `timeout` passes.
pub(crate) async fn wait_for_local_tcp_port(port: u16, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(s) = tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
            drop(s);
            return true;
        }

        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_minecraft_banner() {
        let line = "[12:00:01] [Server thread/INFO]: Done (4.213s)! For help, type \"help\"";
        assert!(is_minecraft_done_line(line));
        assert!(ReadinessProbe::minecraft().matches_line(line));
    }

    #[test]
    fn ignores_partial_banners() {
        assert!(!is_minecraft_done_line("[Server thread/INFO]: Done preparing level"));
        assert!(!is_minecraft_done_line("For help, type \"help\""));
    }

    #[test]
    fn custom_marker_is_pluggable() {
        let probe = ReadinessProbe::output_marker(|l| l.starts_with("READY"));
        assert!(probe.matches_line("READY on 7777"));
        assert!(!probe.matches_line("loading"));
        assert!(!ReadinessProbe::ListeningPort.matches_line("READY"));
    }

    #[tokio::test]
    async fn port_wait_sees_listener() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(wait_for_local_tcp_port(port, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn port_wait_times_out() {
        let port = {
            let l = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
            l.local_addr().unwrap().port()
        };
        assert!(!wait_for_local_tcp_port(port, Duration::from_millis(300)).await);
    }
}
