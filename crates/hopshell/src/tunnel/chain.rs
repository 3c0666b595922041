//! Multi-hop forwarding through shared shells

use super::TunnelResolver;
use crate::config::{LoginResolver, RouteTable};
use crate::shore::{SharedShell, Shore};
use crate::{Result, ShoreError};
use async_trait::async_trait;
use hopshell_ssh::{DirectTunnel, Login, Shell, Tunnel, Tunneling};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Resources a resolver keeps open until it is closed, one per hop and forward
#[derive(Default)]
struct Opened {
    shells: Vec<SharedShell>,
    tunnels: Vec<(Login, Tunneling, Arc<dyn Tunnel>)>,
}

impl Opened {
    /// Keep `shell`, returning the wrapper it supersedes for the same login
    fn keep_shell(&mut self, shell: SharedShell) -> Option<SharedShell> {
        match self.shells.iter_mut().find(|kept| kept.login() == shell.login()) {
            Some(kept) => Some(std::mem::replace(kept, shell)),
            None => {
                self.shells.push(shell);
                None
            }
        }
    }

    /// Keep `tunnel`, returning the handle it supersedes for the same forward
    fn keep_tunnel(&mut self, hop: &Login, spec: &Tunneling, tunnel: Arc<dyn Tunnel>) -> Option<Arc<dyn Tunnel>> {
        match self.tunnels.iter_mut().find(|(login, kept, _)| login == hop && kept == spec) {
            Some((_, _, kept)) => Some(std::mem::replace(kept, tunnel)),
            None => {
                self.tunnels.push((hop.clone(), spec.clone(), tunnel));
                None
            }
        }
    }
}

/// Builds tunnels hop by hop.
///
/// The route to a host is the host itself, the optional `through` hop and the
/// hops listed by the [`RouteTable`]. It is walked from the outermost hop
/// inwards: each hop after the first is reached through the forward opened by
/// the one before it.
pub struct ChainResolver {
    logins: Arc<dyn LoginResolver>,
    routes: Arc<dyn RouteTable>,
    shore: Shore,
    opened: Mutex<Opened>,
}

impl ChainResolver {
    /// Resolve hops with `logins` and `routes`, taking shells from `shore`
    pub fn new(logins: Arc<dyn LoginResolver>, routes: Arc<dyn RouteTable>, shore: Shore) -> Self {
        Self {
            logins,
            routes,
            shore,
            opened: Mutex::new(Opened::default()),
        }
    }

    /// Logins from the outermost hop to the destination
    fn route(&self, host: &str, through: Option<&str>) -> Result<Vec<Login>> {
        let mut route = vec![self.logins.resolve(host)?];
        if let Some(through) = through {
            route.push(self.logins.resolve(through)?);
        }
        if let Some(rule) = self.routes.route(route[0].host()) {
            for hop in rule.split(';').map(str::trim).filter(|hop| !hop.is_empty()) {
                route.push(self.logins.resolve(hop)?);
            }
        }
        route.reverse();
        Ok(route)
    }

    fn opened(&self) -> std::sync::MutexGuard<'_, Opened> {
        self.opened.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn forward(&self, hop: &Login, spec: &Tunneling) -> Result<Arc<dyn Tunnel>> {
        // Prompts at most once per login; the transport picks the secret up from the cache
        hop.credentials().password(hop).await?;

        let shell = self.shore.get_shell(hop).await?;
        let tunnel = shell.tunnel(spec).await;
        let superseded = self.opened().keep_shell(shell);
        if let Some(old) = superseded {
            if let Err(e) = old.close().await {
                warn!("Error releasing shell for {}: {}", old.login(), e);
            }
        }

        // the shore shares forwards, so the superseded handle only drops a reference
        let tunnel: Arc<dyn Tunnel> = Arc::from(tunnel?);
        let superseded = self.opened().keep_tunnel(hop, spec, Arc::clone(&tunnel));
        if let Some(old) = superseded {
            if let Err(e) = old.close().await {
                warn!("Error releasing tunnel {:?}: {}", old, e);
            }
        }
        Ok(tunnel)
    }
}

#[async_trait]
impl TunnelResolver for ChainResolver {
    async fn tunnel(&self, host: &str, port: u16, through: Option<&str>) -> Result<Arc<dyn Tunnel>> {
        let route = self.route(host, through)?;
        if let [only] = route.as_slice() {
            return Ok(Arc::new(DirectTunnel::new(only.host(), port)));
        }

        let last = route.len() - 2;
        let mut current: Option<Arc<dyn Tunnel>> = None;
        for (index, pair) in route.windows(2).enumerate() {
            let hop = match &current {
                Some(previous) => pair[0].retarget("localhost", previous.port()),
                None => pair[0].clone(),
            };
            let next_port = if index == last { port } else { pair[1].port_or_default() };
            let spec = Tunneling::ephemeral(pair[1].host(), next_port);

            debug!("Hop {}: {} -> {}:{}", index, hop, spec.host, spec.port);
            let tunnel = self.forward(&hop, &spec).await.map_err(|source| ShoreError::Hop {
                index,
                hop: hop.to_string(),
                target: format!("{}:{}", spec.host, spec.port),
                source: Box::new(source),
            })?;
            current = Some(tunnel);
        }

        let tunnel = current.ok_or_else(|| ShoreError::Config(format!("no route to {}", host)))?;
        info!(
            "Tunnel to {}:{} ready on {}:{} through {} hops",
            host,
            port,
            tunnel.host(),
            tunnel.port(),
            route.len() - 1
        );
        Ok(tunnel)
    }

    async fn close(&self) {
        let Opened { shells, tunnels } = std::mem::take(&mut *self.opened());

        for (_, _, tunnel) in tunnels.iter().rev() {
            if let Err(e) = tunnel.close().await {
                warn!("Error closing tunnel {:?}: {}", tunnel, e);
            }
        }
        for shell in shells.iter().rev() {
            if let Err(e) = shell.close().await {
                warn!("Error closing shell for {}: {}", shell.login(), e);
            }
        }
        debug!("Chain resolver closed {} tunnels and {} shells", tunnels.len(), shells.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, UNREACHABLE};
    use hopshell_ssh::TransportError;
    use std::collections::HashMap;

    struct Logins;

    impl LoginResolver for Logins {
        fn resolve(&self, spec: &str) -> Result<Login> {
            Ok(Login::parse(spec, "root")?)
        }
    }

    struct Routes(HashMap<&'static str, &'static str>);

    impl RouteTable for Routes {
        fn route(&self, host: &str) -> Option<String> {
            self.0.get(host).map(|via| via.to_string())
        }
    }

    fn resolver(connector: &Arc<MockConnector>, routes: &[(&'static str, &'static str)]) -> ChainResolver {
        ChainResolver::new(
            Arc::new(Logins),
            Arc::new(Routes(routes.iter().copied().collect())),
            Shore::new(connector.clone()),
        )
    }

    #[tokio::test]
    async fn test_single_element_route_is_direct() {
        let connector = Arc::new(MockConnector::new());
        let chain = resolver(&connector, &[]);

        let tunnel = chain.tunnel("alice@db1", 5432, None).await.unwrap();
        assert_eq!((tunnel.host(), tunnel.port()), ("db1", 5432));
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test]
    async fn test_through_hop_is_used() {
        let connector = Arc::new(MockConnector::new());
        let chain = resolver(&connector, &[]);

        let tunnel = chain.tunnel("db1", 5432, Some("ops@bastion")).await.unwrap();
        assert_eq!(tunnel.port(), 40000);
        assert_eq!(
            connector.log(),
            vec!["connect ops@bastion", "tunnel ops@bastion -> db1:5432 @40000"]
        );
    }

    #[tokio::test]
    async fn test_three_hop_route_opens_two_tunnels() {
        let connector = Arc::new(MockConnector::new());
        let chain = resolver(&connector, &[("c", "b;a")]);

        let tunnel = chain.tunnel("c", 8080, None).await.unwrap();
        assert_eq!(tunnel.port(), 40001);
        assert_eq!(
            connector.log(),
            vec![
                "connect root@a",
                "tunnel root@a -> b:22 @40000",
                "connect root@localhost:40000 (b)",
                "tunnel root@localhost:40000 (b) -> c:8080 @40001",
            ]
        );
    }

    #[tokio::test]
    async fn test_route_rule_ignores_empty_entries() {
        let connector = Arc::new(MockConnector::new());
        let chain = resolver(&connector, &[("db1", " ; jump1 ;")]);

        chain.tunnel("db1", 5432, None).await.unwrap();
        assert_eq!(connector.connects(), 1);
        assert_eq!(connector.log()[0], "connect root@jump1");
    }

    #[tokio::test]
    async fn test_hop_failure_names_the_hop() {
        let connector = Arc::new(MockConnector::new());
        let chain = resolver(&connector, &[(UNREACHABLE, "jump1")]);

        let err = chain.tunnel(UNREACHABLE, 80, None).await.unwrap_err();
        match err {
            ShoreError::Hop { index, hop, target, source } => {
                assert_eq!(index, 0);
                assert_eq!(hop, "root@jump1");
                assert_eq!(target, format!("{}:80", UNREACHABLE));
                assert!(matches!(*source, ShoreError::Transport(TransportError::Connection(_))));
            }
            other => panic!("unexpected error: {other}"),
        }

        // the hop shell stays registered until the resolver is closed
        assert_eq!(connector.shells()[0].close_calls(), 0);
        chain.close().await;
        assert_eq!(connector.shells()[0].close_calls(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_a_hop_error() {
        let connector = Arc::new(MockConnector::new());
        connector.fail_next_connects(1);
        let chain = resolver(&connector, &[("db1", "jump1")]);

        let err = chain.tunnel("db1", 5432, None).await.unwrap_err();
        assert!(matches!(err, ShoreError::Hop { index: 0, .. }));
        assert!(chain.tunnel("db1", 5432, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_repeated_requests_hold_one_handle_per_hop() {
        let connector = Arc::new(MockConnector::new());
        let shore = Shore::new(connector.clone());
        let chain = ChainResolver::new(
            Arc::new(Logins),
            Arc::new(Routes([("c", "b;a")].into_iter().collect())),
            shore.clone(),
        );

        for _ in 0..5 {
            let tunnel = chain.tunnel("c", 8080, None).await.unwrap();
            assert_eq!(tunnel.port(), 40001);
        }
        assert_eq!(connector.connects(), 2);

        let outer = Logins.resolve("a").unwrap();
        let inner = Logins.resolve("b").unwrap().retarget("localhost", 40000);
        assert_eq!(shore.references(&outer), 1);
        assert_eq!(shore.references(&inner), 1);
        {
            let opened = chain.opened();
            assert_eq!((opened.shells.len(), opened.tunnels.len()), (2, 2));
        }

        chain.close().await;
        assert_eq!(shore.active(), 0);
        for shell in connector.shells() {
            assert_eq!(shell.close_calls(), 1);
            assert_eq!(shell.tunnel_closes(), vec![1]);
        }
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let connector = Arc::new(MockConnector::new());
        let chain = resolver(&connector, &[("c", "b;a")]);
        chain.tunnel("c", 8080, None).await.unwrap();

        chain.close().await;
        let shells = connector.shells();
        assert_eq!(shells.len(), 2);
        for shell in shells {
            assert_eq!(shell.close_calls(), 1);
            assert_eq!(shell.tunnel_closes(), vec![1]);
        }

        chain.close().await;
    }
}
