//! Attribute-sharing graph backing the graph-assisted match layer.
//!
//! Vertices are unit records from both registries; an edge connects two
//! units that share a contact phone, a legal representative, or a
//! normalized address. The graph is built eagerly at task start over a
//! bounded window of SECONDARY records; primaries are added page by page
//! as they are matched.

use std::collections::{HashMap, HashSet};

use petgraph::graph::{NodeIndex, UnGraph};

use crate::models::{NormalizedUnit, SourceKind};

/// Which attribute an edge represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrKind {
    Phone,
    LegalRepresentative,
    Address,
}

impl AttrKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttrKind::Phone => "phone",
            AttrKind::LegalRepresentative => "legal_representative",
            AttrKind::Address => "address",
        }
    }
}

/// Beyond this many holders, a shared attribute value stops being
/// discriminating; new vertices only link to the earliest holders.
const MAX_SHARED_VALUE_FANOUT: usize = 32;

/// What a graph vertex stands for.
#[derive(Debug, Clone)]
pub struct VertexRef {
    pub source: SourceKind,
    pub id: String,
}

/// Compact joined form of the tagged address components, used as the
/// shared-address edge key.
pub fn address_signature(unit: &NormalizedUnit) -> String {
    let mut signature = String::new();
    for part in [
        &unit.address_province,
        &unit.address_city,
        &unit.address_district,
        &unit.address_detail,
    ] {
        for token in part.iter() {
            signature.push_str(token);
        }
    }
    signature
}

pub struct AttributeGraph {
    graph: UnGraph<VertexRef, AttrKind>,
    vertex_index: HashMap<(SourceKind, String), NodeIndex>,
    value_index: HashMap<(AttrKind, String), Vec<NodeIndex>>,
}

impl Default for AttributeGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeGraph {
    pub fn new() -> Self {
        Self {
            graph: UnGraph::new_undirected(),
            vertex_index: HashMap::new(),
            value_index: HashMap::new(),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn vertices(&self) -> impl Iterator<Item = &VertexRef> {
        self.graph.node_weights()
    }

    /// Insert a unit and connect it to earlier holders of each of its
    /// attribute values. Re-inserting the same (source, id) is a no-op.
    pub fn add_unit(&mut self, source: SourceKind, id: &str, normalized: &NormalizedUnit) {
        if self.vertex_index.contains_key(&(source, id.to_string())) {
            return;
        }
        let node = self.graph.add_node(VertexRef {
            source,
            id: id.to_string(),
        });
        self.vertex_index.insert((source, id.to_string()), node);

        let mut attrs: Vec<(AttrKind, String)> = Vec::new();
        if !normalized.contact_phone.is_empty() {
            attrs.push((AttrKind::Phone, normalized.contact_phone.clone()));
        }
        if !normalized.legal_representative.is_empty() {
            attrs.push((
                AttrKind::LegalRepresentative,
                normalized.legal_representative.clone(),
            ));
        }
        let addr = address_signature(normalized);
        if !addr.is_empty() {
            attrs.push((AttrKind::Address, addr));
        }

        for (kind, value) in attrs {
            let holders = self.value_index.entry((kind, value)).or_default();
            for other in holders.iter().take(MAX_SHARED_VALUE_FANOUT) {
                self.graph.add_edge(node, *other, kind);
            }
            holders.push(node);
        }
    }

    /// Number of distinct attribute kinds shared by two units, 0 when
    /// either is unknown to the graph.
    pub fn shared_attribute_count(
        &self,
        a: (SourceKind, &str),
        b: (SourceKind, &str),
    ) -> usize {
        let Some(&node_a) = self.vertex_index.get(&(a.0, a.1.to_string())) else {
            return 0;
        };
        let Some(&node_b) = self.vertex_index.get(&(b.0, b.1.to_string())) else {
            return 0;
        };
        let kinds: HashSet<AttrKind> = self
            .graph
            .edges_connecting(node_a, node_b)
            .map(|edge| *edge.weight())
            .collect();
        kinds.len()
    }
}

/// Corroboration boost: 0.5 base plus 0.2 per shared attribute kind,
/// capped at 1.0. No shared attribute means no boost at all.
pub fn graph_boost(shared_attr_count: usize) -> f64 {
    if shared_attr_count == 0 {
        return 0.0;
    }
    (0.5 + 0.2 * shared_attr_count as f64).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Unit;
    use crate::normalize::normalize_unit;

    fn normalized(phone: &str, legal: &str, address: &str) -> NormalizedUnit {
        normalize_unit(&Unit {
            id: "x".into(),
            name: "某单位".into(),
            contact_phone: if phone.is_empty() { None } else { Some(phone.into()) },
            legal_representative: if legal.is_empty() { None } else { Some(legal.into()) },
            address: if address.is_empty() { None } else { Some(address.into()) },
            ..Unit::default()
        })
    }

    #[test]
    fn shared_attributes_create_typed_edges() {
        let mut graph = AttributeGraph::new();
        graph.add_unit(
            SourceKind::Secondary,
            "S1",
            &normalized("13900001111", "张三", "上海市虹口区四川北路1234号"),
        );
        graph.add_unit(
            SourceKind::Primary,
            "P1",
            &normalized("13900001111", "张三", ""),
        );

        assert_eq!(
            graph.shared_attribute_count((SourceKind::Primary, "P1"), (SourceKind::Secondary, "S1")),
            2
        );
    }

    #[test]
    fn unknown_units_share_nothing() {
        let graph = AttributeGraph::new();
        assert_eq!(
            graph.shared_attribute_count((SourceKind::Primary, "P1"), (SourceKind::Secondary, "S9")),
            0
        );
    }

    #[test]
    fn reinsert_is_a_noop() {
        let mut graph = AttributeGraph::new();
        let n = normalized("13900001111", "", "");
        graph.add_unit(SourceKind::Secondary, "S1", &n);
        graph.add_unit(SourceKind::Secondary, "S1", &n);
        assert_eq!(graph.vertex_count(), 1);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn boost_scales_with_corroboration() {
        assert_eq!(graph_boost(0), 0.0);
        assert_eq!(graph_boost(1), 0.7);
        assert_eq!(graph_boost(2), 0.9);
        assert_eq!(graph_boost(3), 1.0);
        assert_eq!(graph_boost(10), 1.0);
    }

    #[test]
    fn same_address_links_units() {
        let mut graph = AttributeGraph::new();
        graph.add_unit(
            SourceKind::Secondary,
            "S1",
            &normalized("", "", "福建省福州市仓山区金山大道618号"),
        );
        graph.add_unit(
            SourceKind::Secondary,
            "S2",
            &normalized("", "", "福建省福州市仓山区金山大道618号"),
        );
        assert_eq!(
            graph.shared_attribute_count(
                (SourceKind::Secondary, "S1"),
                (SourceKind::Secondary, "S2")
            ),
            1
        );
    }
}
