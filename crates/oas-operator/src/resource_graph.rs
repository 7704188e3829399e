//! Static chain of the resources the operator reads and writes
//!
//! Shows, without contacting a cluster, where every synced object is copied
//! from and which objects the ClusterOperator record points at. Rendered as
//! Graphviz DOT or as plain `from -> to` lines.

use std::collections::BTreeSet;
use std::fmt::Write;

use clap::ValueEnum;

use oas_common::crd::ObjectReference;
use oas_common::{CLUSTER_OPERATOR_NAME, TARGET_NAMESPACE};
use oas_controllers::config_observer::{CLUSTER_CONFIG_NAME, IMAGE_IMPORT_CA_NAME};
use oas_controllers::{default_sync_rules, ResourceLocation};

use crate::startup::related_objects;

/// Output format of the graph
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum GraphFormat {
    /// Graphviz DOT
    #[default]
    Dot,
    /// One edge per line
    Text,
}

/// Directed, labelled edge between two resources
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Edge {
    /// Resource the data flows from
    pub from: String,
    /// Resource the data flows to
    pub to: String,
    /// What flows along the edge
    pub label: String,
}

/// Resources and the edges between them
#[derive(Clone, Debug, Default)]
pub struct ResourceGraph {
    edges: Vec<Edge>,
}

fn location_node(resource: &str, location: &ResourceLocation) -> String {
    format!("{}/{}/{}", resource, location.namespace, location.name)
}

fn reference_node(reference: &ObjectReference) -> String {
    let resource = if reference.group.is_empty() {
        reference.resource.clone()
    } else {
        format!("{}.{}", reference.resource, reference.group)
    };
    if reference.namespace.is_empty() {
        format!("{}/{}", resource, reference.name)
    } else {
        format!("{}/{}/{}", resource, reference.namespace, reference.name)
    }
}

impl ResourceGraph {
    /// The graph as wired at startup
    pub fn operator() -> Self {
        let mut graph = Self::default();

        let rules = default_sync_rules();
        for rule in &rules.config_maps {
            graph.add(
                location_node("configmaps", &rule.source),
                location_node("configmaps", &rule.destination),
                "sync",
            );
        }
        for rule in &rules.secrets {
            graph.add(
                location_node("secrets", &rule.source),
                location_node("secrets", &rule.destination),
                "sync",
            );
        }

        // The image-import CA source is only known once the Image config is observed
        graph.add(
            reference_node(&ObjectReference::cluster_scoped(
                "config.openshift.io",
                "images",
                CLUSTER_CONFIG_NAME,
            )),
            location_node(
                "configmaps",
                &ResourceLocation::new(TARGET_NAMESPACE, IMAGE_IMPORT_CA_NAME),
            ),
            "additionalTrustedCA",
        );

        let cluster_operator = reference_node(&ObjectReference::cluster_scoped(
            "config.openshift.io",
            "clusteroperators",
            CLUSTER_OPERATOR_NAME,
        ));
        for related in related_objects() {
            graph.add(cluster_operator.clone(), reference_node(&related), "relatedObject");
        }
        graph
    }

    fn add(&mut self, from: String, to: String, label: &str) {
        self.edges.push(Edge {
            from,
            to,
            label: label.to_string(),
        });
    }

    /// Edges in insertion order
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Every resource named by an edge
    pub fn nodes(&self) -> BTreeSet<&str> {
        self.edges
            .iter()
            .flat_map(|e| [e.from.as_str(), e.to.as_str()])
            .collect()
    }

    /// Render in `format`
    pub fn render(&self, format: GraphFormat) -> String {
        match format {
            GraphFormat::Dot => self.to_dot(),
            GraphFormat::Text => self.to_text(),
        }
    }

    fn to_dot(&self) -> String {
        let mut out = String::from("digraph \"openshift-apiserver-operator\" {\n");
        for node in self.nodes() {
            let _ = writeln!(out, "  \"{}\";", node);
        }
        for edge in &self.edges {
            let _ = writeln!(
                out,
                "  \"{}\" -> \"{}\" [label=\"{}\"];",
                edge.from, edge.to, edge.label
            );
        }
        out.push_str("}\n");
        out
    }

    fn to_text(&self) -> String {
        self.edges
            .iter()
            .map(|e| format!("{} -> {} ({})\n", e.from, e.to, e.label))
            .collect()
    }
}
