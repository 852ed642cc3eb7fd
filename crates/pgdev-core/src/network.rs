//! Network mapping for a locally published database.
//!
//! The database container publishes one host port. Host processes reach it
//! on `localhost`, sibling containers through the docker host gateway.

use pgdev_types::{NetworkInstance, Scope};

/// Host name under which containers reach the docker host.
pub const DOCKER_HOST: &str = "host.docker.internal";

/// Maps a published port onto one [`NetworkInstance`] per [`Scope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkMapper {
    host_port: u16,
}

impl NetworkMapper {
    /// Mapper for a database published on `host_port` of this machine.
    pub const fn local(host_port: u16) -> Self {
        Self { host_port }
    }

    /// Published host port.
    pub const fn host_port(self) -> u16 {
        self.host_port
    }

    /// Host name reachable from `scope`.
    pub const fn host(scope: Scope) -> &'static str {
        match scope {
            Scope::Native | Scope::Public => "localhost",
            Scope::Container => DOCKER_HOST,
        }
    }

    /// One instance per scope, in [`Scope::ALL`] order.
    pub fn instances(self) -> Vec<NetworkInstance> {
        Scope::ALL
            .iter()
            .map(|scope| NetworkInstance::new(Self::host(*scope), self.host_port, *scope))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn local_mapping_covers_every_scope() {
        let instances = NetworkMapper::local(15432).instances();
        assert_eq!(instances.len(), 3);

        let address = |scope| {
            NetworkInstance::find(&instances, scope)
                .unwrap()
                .address
                .clone()
        };
        assert_eq!(address(Scope::Native), "localhost:15432");
        assert_eq!(address(Scope::Container), "host.docker.internal:15432");
        assert_eq!(address(Scope::Public), "localhost:15432");
        assert!(instances.iter().all(|i| i.port == 15432));
    }
}
