use std::collections::BTreeSet;

use pretty_assertions::assert_eq;
use provenance_graph::{Edge, Graph, Vertex, VertexId};

fn vertex(kind: &str, name: &str) -> Vertex {
    Vertex::from_pairs([("type", kind), ("name", name)]).expect("valid vertex")
}

// Two overlapping graphs: A = {p, a1, a2, p->a1}, B = {a1, a2, a3, p->a1, a2->a3}
fn overlapping() -> (Graph, Graph) {
    let p = vertex("Process", "p");
    let a1 = vertex("Artifact", "a1");
    let a2 = vertex("Artifact", "a2");
    let a3 = vertex("Artifact", "a3");
    let p_a1 = Edge::between(&p, &a1, [("type", "Used")]).unwrap();
    let a2_a3 = Edge::between(&a2, &a3, [("type", "WasDerivedFrom")]).unwrap();

    let mut a = Graph::new();
    a.put_vertex(p);
    a.put_vertex(a1.clone());
    a.put_vertex(a2.clone());
    a.put_edge(p_a1.clone());

    let mut b = Graph::new();
    b.put_vertex(a1);
    b.put_vertex(a2);
    b.put_vertex(a3);
    b.put_edge(p_a1);
    b.put_edge(a2_a3);

    (a, b)
}

#[test]
fn test_union_is_commutative() {
    let (a, b) = overlapping();
    assert_eq!(Graph::union(&a, &b), Graph::union(&b, &a));
    assert_eq!(Graph::union(&a, &b).vertex_count(), 4);
    assert_eq!(Graph::union(&a, &b).edge_count(), 2);
}

#[test]
fn test_intersection_is_subset_of_both() {
    let (a, b) = overlapping();
    let common = Graph::intersection(&a, &b);

    let both: BTreeSet<VertexId> = a.vertex_ids().intersection(&b.vertex_ids()).cloned().collect();
    assert!(common.vertex_ids().is_subset(&both));
    assert_eq!(common.vertex_ids(), both);
    assert_eq!(common.edge_count(), 1);
    assert_eq!(Graph::intersection(&a, &b), Graph::intersection(&b, &a));
}

#[test]
fn test_union_absorbs_intersection() {
    let (a, b) = overlapping();
    let absorbed = Graph::union(&a, &Graph::intersection(&a, &b));
    assert_eq!(absorbed, a);
}

#[test]
fn test_difference_removes_shared_elements() {
    let (a, b) = overlapping();
    let only_a = Graph::difference(&a, &b);
    assert_eq!(only_a.vertex_count(), 1);
    assert_eq!(only_a.edge_count(), 0);
    assert!(!only_a.intersects(&b));

    let rebuilt = Graph::union(&only_a, &Graph::intersection(&a, &b));
    assert_eq!(rebuilt, a);
}

#[test]
fn test_operands_are_untouched() {
    let (a, b) = overlapping();
    let (a_before, b_before) = (a.clone(), b.clone());
    let _ = Graph::union(&a, &b);
    let _ = Graph::intersection(&a, &b);
    let _ = Graph::difference(&a, &b);
    assert_eq!(a, a_before);
    assert_eq!(b, b_before);
}

#[test]
fn test_unresolved_marks_survive_union() {
    let (mut a, b) = overlapping();
    let net = Vertex::from_pairs([("type", "Network"), ("remote address", "10.2.0.1")]).unwrap();
    a.put_vertex(net.clone());
    a.mark_unresolved(net.id());

    let merged = Graph::union(&a, &b);
    assert!(merged.is_unresolved(net.id()));
    assert!(!Graph::intersection(&a, &b).is_partial());
}
