//! Immutable description of one `ssh -D` tunnel to establish.

#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub socks_port: u16,
    pub identity_file: Option<String>,
    pub extra_args: Vec<String>,
}

impl TunnelSpec {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, socks_port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            socks_port,
            identity_file: None,
            extra_args: Vec::new(),
        }
    }

    pub fn with_identity_file(mut self, identity_file: impl Into<String>) -> Self {
        self.identity_file = Some(identity_file.into());
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Validate the spec: a tunnel cannot be started against an empty host,
    /// user, or a port 0.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("tunnel spec is missing a host");
        }
        if self.user.trim().is_empty() {
            anyhow::bail!("tunnel spec is missing a user");
        }
        if self.socks_port == 0 {
            anyhow::bail!("tunnel spec has an invalid SOCKS port 0");
        }
        Ok(())
    }

    /// Build the `ssh` argument vector per §6's reference command line.
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-N".to_string(),
            "-T".to_string(),
            "-D".to_string(),
            format!("127.0.0.1:{}", self.socks_port),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
        ];

        if let Some(identity_file) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.clone());
        }
        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }

        args.extend(self.extra_args.iter().cloned());
        args.push(format!("{}@{}", self.user, self.host));
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_host_or_user() {
        assert!(TunnelSpec::new("", 22, "codex", 1080).validate().is_err());
        assert!(TunnelSpec::new("example.com", 22, "", 1080).validate().is_err());
        assert!(TunnelSpec::new("example.com", 22, "codex", 0).validate().is_err());
    }

    #[test]
    fn builds_hardened_ssh_command_line() {
        let spec = TunnelSpec::new("example.com", 2222, "codex", 41000)
            .with_identity_file("/home/codex/.ssh/id_ed25519");
        let args = spec.ssh_args();
        assert!(args.contains(&"-N".to_string()));
        assert!(args.contains(&"-T".to_string()));
        assert!(args.contains(&"127.0.0.1:41000".to_string()));
        assert!(args.contains(&"ServerAliveInterval=30".to_string()));
        assert!(args.contains(&"ExitOnForwardFailure=yes".to_string()));
        assert!(args.contains(&"-p".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert_eq!(args.last().unwrap(), "codex@example.com");
    }

    #[test]
    fn omits_port_flag_for_default_ssh_port() {
        let spec = TunnelSpec::new("example.com", 22, "codex", 41000);
        assert!(!spec.ssh_args().contains(&"-p".to_string()));
    }
}
