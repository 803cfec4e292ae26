//! Routing-path search for transfer orders.
//!
//! Accounts, their addresses and the networks between them form a weighted
//! graph: account and address are joined for free, leaving an address for its
//! network is free, and arriving on an address costs half the network's
//! commission. The cheapest walk from the credit account to the debit account
//! is the order's routing path.

use std::collections::HashMap;

use petgraph::algo::astar;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::transfer::{routing_path, Hop, TransferAddress};

/// Fee schedule of one transfer network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferNetwork {
    pub network_id: String,
    pub commission: f64,
}

impl TransferNetwork {
    pub fn new(network_id: &str, commission: f64) -> Self {
        Self {
            network_id: network_id.into(),
            commission,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Node {
    Account(String),
    Address { network_id: String, address: String },
    Network(String),
}

#[derive(Default)]
struct Graph {
    inner: DiGraph<Node, f64>,
    index: HashMap<Node, NodeIndex>,
}

impl Graph {
    fn node(&mut self, node: Node) -> NodeIndex {
        if let Some(ix) = self.index.get(&node) {
            return *ix;
        }
        let ix = self.inner.add_node(node.clone());
        self.index.insert(node, ix);
        ix
    }

    fn link(&mut self, from: NodeIndex, to: NodeIndex, cost: f64) {
        if self.inner.find_edge(from, to).is_none() {
            self.inner.add_edge(from, to, cost);
        }
    }
}

/// Cheapest hops from `credit_account_id` to `debit_account_id` over `addresses`.
/// Addresses on a network without a known commission are left out.
pub fn shortest_route<'a>(
    addresses: impl IntoIterator<Item = &'a TransferAddress>,
    commissions: &HashMap<String, f64>,
    credit_account_id: &str,
    debit_account_id: &str,
) -> Option<(f64, Vec<Hop>)> {
    let mut g = Graph::default();
    for a in addresses {
        let Some(commission) = commissions.get(&a.network_id) else {
            tracing::debug!(network_id = %a.network_id, address = %a.address, "network has no commission, skipped");
            continue;
        };
        let account = g.node(Node::Account(a.account_id.clone()));
        let address = g.node(Node::Address {
            network_id: a.network_id.clone(),
            address: a.address.clone(),
        });
        let network = g.node(Node::Network(a.network_id.clone()));
        g.link(account, address, 0.0);
        g.link(address, account, 0.0);
        g.link(network, address, commission / 2.0);
        g.link(address, network, 0.0);
    }

    let start = *g.index.get(&Node::Account(credit_account_id.to_string()))?;
    let goal = *g.index.get(&Node::Account(debit_account_id.to_string()))?;
    if start == goal {
        return None;
    }
    let (cost, nodes) = astar(&g.inner, start, |n| n == goal, |e| *e.weight(), |_| 0.0)?;
    let walk: Vec<&Node> = nodes.iter().map(|ix| &g.inner[*ix]).collect();
    hops(&walk).map(|hops| (cost, hops))
}

/// Split `acc addr net addr acc ...` into hops. Anything else (two accounts
/// sharing an address) does not make a route.
fn hops(walk: &[&Node]) -> Option<Vec<Hop>> {
    if walk.len() < 5 || (walk.len() - 1) % 4 != 0 {
        return None;
    }
    walk.windows(5)
        .step_by(4)
        .map(|w| match w {
            [Node::Account(tx_acc), Node::Address { address: tx_addr, .. }, Node::Network(net), Node::Address { address: rx_addr, .. }, Node::Account(rx_acc)] => {
                Some(Hop::new(tx_acc, tx_addr, net, rx_addr, rx_acc))
            }
            _ => None,
        })
        .collect()
}

/// Known addresses and networks, with routing paths cached per
/// `(currency, credit, debit)` until the next [`RouteTable::update`].
#[derive(Debug, Default)]
pub struct RouteTable {
    addresses: Vec<TransferAddress>,
    commissions: HashMap<String, f64>,
    cache: HashMap<(String, String, String), Option<String>>,
}

impl RouteTable {
    pub fn new(addresses: Vec<TransferAddress>, networks: &[TransferNetwork]) -> Self {
        let mut table = Self::default();
        table.update(addresses, networks);
        table
    }

    pub fn update(&mut self, addresses: Vec<TransferAddress>, networks: &[TransferNetwork]) {
        self.addresses = addresses;
        self.commissions = networks
            .iter()
            .map(|n| (n.network_id.clone(), n.commission))
            .collect();
        self.cache.clear();
    }

    /// Encoded routing path, or `None` when the accounts are not connected.
    pub fn route(&mut self, currency: &str, credit_account_id: &str, debit_account_id: &str) -> Option<String> {
        let key = (
            currency.to_string(),
            credit_account_id.to_string(),
            debit_account_id.to_string(),
        );
        if let Some(hit) = self.cache.get(&key) {
            return hit.clone();
        }
        let found = shortest_route(
            self.addresses.iter().filter(|a| a.currency == currency),
            &self.commissions,
            credit_account_id,
            debit_account_id,
        );
        let path = found.and_then(|(cost, hops)| {
            tracing::debug!(credit_account_id, debit_account_id, cost, hops = hops.len(), "routing path computed");
            routing_path(&hops)
        });
        self.cache.insert(key, path.clone());
        path
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::decode_path;

    fn addr(acc: &str, net: &str, address: &str) -> TransferAddress {
        TransferAddress::new(acc, "USDT", net, address)
    }

    fn table() -> RouteTable {
        RouteTable::new(
            vec![
                addr("A", "TRC20", "a-trc"),
                addr("X", "TRC20", "x-trc"),
                addr("X", "ERC20", "x-erc"),
                addr("B", "ERC20", "b-erc"),
                addr("B", "BEP20", "b-bep"),
                addr("A", "BEP20", "a-bep"),
            ],
            &[
                TransferNetwork::new("TRC20", 1.0),
                TransferNetwork::new("ERC20", 2.0),
                TransferNetwork::new("BEP20", 10.0),
            ],
        )
    }

    #[test]
    fn cheapest_multi_hop_route_wins() {
        let mut t = table();
        // TRC20 then ERC20 through X is cheaper than BEP20 straight to B.
        let path = t.route("USDT", "A", "B").unwrap();
        assert_eq!(
            decode_path(&path),
            ["A", "a-trc", "TRC20", "x-trc", "X", "x-erc", "ERC20", "b-erc", "B"]
        );

        let mut order = crate::transfer::TransferOrder::new("o1", "A", "B", "USDT", 1.0, 0);
        order.routing_path = Some(path);
        order.advance(0).unwrap();
        assert_eq!(order.current_rx_account_id.as_deref(), Some("X"));
    }

    #[test]
    fn direct_route_when_cheaper() {
        let mut t = RouteTable::new(
            table().addresses,
            &[
                TransferNetwork::new("TRC20", 4.0),
                TransferNetwork::new("ERC20", 4.0),
                TransferNetwork::new("BEP20", 2.0),
            ],
        );
        let path = t.route("USDT", "A", "B").unwrap();
        assert_eq!(decode_path(&path), ["A", "a-bep", "BEP20", "b-bep", "B"]);
    }

    #[test]
    fn routes_are_cached_until_update() {
        let mut t = table();
        assert!(t.route("USDT", "A", "B").is_some());
        assert!(t.route("USDT", "A", "C").is_none());
        assert_eq!(t.cached(), 2);
        t.update(vec![addr("A", "TRC20", "a-trc"), addr("C", "TRC20", "c-trc")], &[TransferNetwork::new("TRC20", 1.0)]);
        assert_eq!(t.cached(), 0);
        assert!(t.route("USDT", "A", "C").is_some());
        assert!(t.route("USDT", "A", "B").is_none());
    }

    #[test]
    fn other_currencies_and_unpriced_networks_are_ignored() {
        let mut t = RouteTable::new(
            vec![
                addr("A", "TRC20", "a-trc"),
                TransferAddress::new("B", "BTC", "TRC20", "b-trc"),
                addr("A", "SOL", "a-sol"),
                addr("B", "SOL", "b-sol"),
            ],
            &[TransferNetwork::new("TRC20", 1.0)],
        );
        assert_eq!(t.route("USDT", "A", "B"), None);
        assert_eq!(t.route("USDT", "A", "A"), None);
    }
}
