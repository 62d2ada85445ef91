use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Join a host and a port into an address `TcpListener::bind`/`TcpStream::connect` accept.
///
/// Bare IPv6 literals are bracketed.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Read a `FILEMGR_LOG` style verbosity: a number (`0` is info, anything
/// higher is debug) or a level name. `None` means the value is a module
/// filter and should go to `env_logger` as is.
pub fn parse_log_level(value: &str) -> Option<log::LevelFilter> {
    let value = value.trim();
    if let Ok(n) = value.parse::<i64>() {
        return Some(if n <= 0 {
            log::LevelFilter::Info
        } else {
            log::LevelFilter::Debug
        });
    }
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels() {
        use log::LevelFilter;

        assert_eq!(parse_log_level("0"), Some(LevelFilter::Info));
        assert_eq!(parse_log_level("-1"), Some(LevelFilter::Info));
        assert_eq!(parse_log_level("1"), Some(LevelFilter::Debug));
        assert_eq!(parse_log_level(" 3 "), Some(LevelFilter::Debug));
        assert_eq!(parse_log_level("WARN"), Some(LevelFilter::Warn));
        assert_eq!(parse_log_level("trace"), Some(LevelFilter::Trace));
        assert_eq!(parse_log_level("rfm=debug"), None);
    }

    #[test]
    fn join_ipv4_and_names() {
        assert_eq!(join_host_port("127.0.0.1", 5001), "127.0.0.1:5001");
        assert_eq!(join_host_port("localhost", 80), "localhost:80");
    }

    #[test]
    fn join_brackets_ipv6() {
        assert_eq!(join_host_port("::1", 5001), "[::1]:5001");
        assert_eq!(join_host_port("[::1]", 5001), "[::1]:5001");
    }
}
