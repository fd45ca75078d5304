// GC behavior tests exercising the heap API directly: reachability
// preservation, shared subgraphs, cycles, long chains, generations and
// the write barrier.

use quill::backend::vm::heap::Heap;
use quill::backend::vm::value::{GcObject, HeaderPtr, Record, Value};

fn set_field(heap: &mut Heap, rec: *mut GcObject<Record>, name: &str, val: Value) {
    unsafe {
        (*rec).data.fields.insert(name.to_string(), val);
    }
    heap.write_barrier(rec as HeaderPtr, val);
}

fn get_field(rec: *mut GcObject<Record>, name: &str) -> Option<Value> {
    unsafe { (*rec).data.fields.get(name).copied() }
}

#[test]
fn empty_root_set_collects_everything() {
    let mut heap = Heap::new();
    for _ in 0..100 {
        heap.alloc_record();
    }
    assert_eq!(heap.alive_objects, 100);
    heap.full_gc(&[]);
    assert_eq!(heap.alive_objects, 0);
}

#[test]
fn shared_subgraph_survives_partial_root_drop() {
    let mut heap = Heap::new();
    let r1 = heap.alloc_record();
    let r2 = heap.alloc_record();
    let shared = heap.alloc_record();
    let tail = heap.alloc_record();

    set_field(&mut heap, tail, "v", Value::Int(42));
    set_field(&mut heap, r1, "rhs", Value::Record(shared));
    set_field(&mut heap, shared, "rhs", Value::Record(tail));
    set_field(&mut heap, r2, "lhs", Value::Record(shared));

    heap.full_gc(&[Value::Record(r1), Value::Record(r2)]);
    assert_eq!(heap.alive_objects, 4);

    // r1 dropped: shared and tail stay reachable through r2
    heap.full_gc(&[Value::Record(r2)]);
    assert_eq!(heap.alive_objects, 3);
    let shared_again = get_field(r2, "lhs").unwrap();
    let Value::Record(shared_rec) = shared_again else {
        panic!("r2.lhs should still be a record");
    };
    let Some(Value::Record(tail_rec)) = get_field(shared_rec, "rhs") else {
        panic!("shared.rhs should still be a record");
    };
    assert!(matches!(get_field(tail_rec, "v"), Some(Value::Int(42))));

    heap.full_gc(&[]);
    assert_eq!(heap.alive_objects, 0);
}

#[test]
fn self_cycle_is_kept_while_rooted_and_freed_after() {
    let mut heap = Heap::new();
    let rec = heap.alloc_record();
    set_field(&mut heap, rec, "left", Value::Record(rec));
    set_field(&mut heap, rec, "right", Value::Record(rec));

    for _ in 0..3 {
        heap.full_gc(&[Value::Record(rec)]);
        assert_eq!(heap.alive_objects, 1);
    }

    heap.full_gc(&[]);
    assert_eq!(heap.alive_objects, 0);
}

#[test]
fn long_chain_is_fully_reachable_and_collectable() {
    const N: usize = 5000;
    let mut heap = Heap::new();
    let mut nodes = Vec::with_capacity(N);
    let head = heap.alloc_record();
    nodes.push(head);
    for _ in 1..N {
        let node = heap.alloc_record();
        let prev = *nodes.last().unwrap();
        set_field(&mut heap, prev, "next", Value::Record(node));
        nodes.push(node);
    }
    assert_eq!(heap.alive_objects, N);

    // deep graph: marking must not recurse
    heap.full_gc(&[Value::Record(head)]);
    assert_eq!(heap.alive_objects, N);

    for k in [1usize, 100, 2500, 4999] {
        heap.full_gc(&[Value::Record(nodes[k])]);
        assert_eq!(heap.alive_objects, N - k);
    }

    heap.full_gc(&[]);
    assert_eq!(heap.alive_objects, 0);
}

#[test]
fn write_barrier_keeps_young_children_of_old_objects() {
    let mut heap = Heap::new();
    let old = heap.alloc_record();
    // promote to the old generation
    heap.full_gc(&[Value::Record(old)]);
    assert!(heap.is_old(old as HeaderPtr));

    let young = heap.alloc_record();
    set_field(&mut heap, young, "v", Value::Int(7));
    assert!(heap.is_young(young as HeaderPtr));
    set_field(&mut heap, old, "child", Value::Record(young));

    // no explicit roots: the child is only reachable through the
    // remembered set
    heap.minor_gc(&[]);
    assert_eq!(heap.alive_objects, 2);
    assert!(matches!(get_field(young, "v"), Some(Value::Int(7))));

    heap.full_gc(&[]);
    assert_eq!(heap.alive_objects, 0);
}

#[test]
fn minor_gc_spares_unreachable_old_objects() {
    let mut heap = Heap::new();
    let old = heap.alloc_record();
    heap.full_gc(&[Value::Record(old)]);

    let young = heap.alloc_record();
    assert_eq!(heap.alive_objects, 2);

    // the unmarked old object survives a minor collection, the
    // unreachable young one does not
    heap.minor_gc(&[]);
    assert_eq!(heap.alive_objects, 1);
    let _ = young;

    heap.full_gc(&[]);
    assert_eq!(heap.alive_objects, 0);
}

#[test]
fn survivors_of_minor_gc_are_promoted() {
    let mut heap = Heap::new();
    let rec = heap.alloc_record();
    assert!(heap.is_young(rec as HeaderPtr));
    heap.minor_gc(&[Value::Record(rec)]);
    assert!(heap.is_old(rec as HeaderPtr));
    assert_eq!(heap.alive_objects, 1);
}

#[test]
fn strings_are_interned_and_purged() {
    let mut heap = Heap::new();
    let a = heap.alloc_string("hello".to_string());
    let b = heap.alloc_string("hello".to_string());
    assert_eq!(a, b);
    assert_eq!(heap.alive_objects, 1);

    heap.full_gc(&[]);
    assert_eq!(heap.alive_objects, 0);
    assert!(heap.string_pool.is_empty());

    // a fresh allocation after the purge gets a fresh object
    let c = heap.alloc_string("hello".to_string());
    assert_eq!(heap.alive_objects, 1);
    let _ = c;
}

#[test]
fn closure_keeps_captured_cells_alive() {
    let mut heap = Heap::new();
    let func = quill::bytecode::Function::default();
    let cell = heap.alloc_reference(Value::Int(1));
    let closure = heap.alloc_closure(&func as *const _, vec![cell]);
    heap.full_gc(&[Value::Closure(closure)]);
    assert_eq!(heap.alive_objects, 2);

    // the cell's contents are traced too
    let rec = heap.alloc_record();
    unsafe {
        (*cell).data.cell = Value::Record(rec);
    }
    heap.write_barrier(cell as HeaderPtr, Value::Record(rec));
    heap.full_gc(&[Value::Closure(closure)]);
    assert_eq!(heap.alive_objects, 3);

    heap.full_gc(&[]);
    assert_eq!(heap.alive_objects, 0);
}
