//! Property-based tests for the round-trip/idempotence invariants that
//! don't depend on a specific recorded trace shape: constant-pool dedup,
//! rollback truncation, and exit-patch idempotence.

use proptest::prelude::*;

use tracejit_core::extern_api::patch_exit;
use tracejit_core::ir::{ConstVal, IrBuffer, IrType, Op, Ref, TypeTag, REF_FIRST};
use tracejit_core::mcode::McodeArena;

proptest! {
    /// Interning the same constant value twice always returns the same ref
    /// and reads back the original value, regardless of how large or small
    /// the value is.
    #[test]
    fn intern_const_dedups_equal_values(v in any::<i32>()) {
        let mut buf = IrBuffer::new();
        let r1 = buf.intern_const(ConstVal::Int(v)).unwrap();
        let r2 = buf.intern_const(ConstVal::Int(v)).unwrap();
        prop_assert_eq!(r1, r2);
        prop_assert_eq!(buf.const_val(r1), ConstVal::Int(v));
    }

    /// Two distinct values never collide on the same ref.
    #[test]
    fn intern_const_distinguishes_unequal_values(a in any::<i32>(), b in any::<i32>()) {
        prop_assume!(a != b);
        let mut buf = IrBuffer::new();
        let ra = buf.intern_const(ConstVal::Int(a)).unwrap();
        let rb = buf.intern_const(ConstVal::Int(b)).unwrap();
        prop_assert_ne!(ra, rb);
    }

    /// Rolling back to any ref within an emitted run truncates `next_ref()`
    /// to exactly that ref, no matter how many instructions came after it.
    #[test]
    fn rollback_truncates_to_exact_ref(n in 1usize..40, idx in 0usize..40) {
        prop_assume!(idx <= n);
        let mut buf = IrBuffer::new();
        for i in 0..n {
            let k = buf.intern_const(ConstVal::Int(i as i32)).unwrap();
            buf.emit_raw(Op::Kint, IrType::new(TypeTag::Int), k, 0).unwrap();
        }
        let to_ref: Ref = REF_FIRST + idx as Ref;
        buf.rollback(to_ref);
        prop_assert_eq!(buf.next_ref(), to_ref);
    }

    /// Rolling back twice to the same ref is idempotent: the second call
    /// finds nothing left to undo.
    #[test]
    fn rollback_twice_is_stable(n in 1usize..40, idx in 0usize..40) {
        prop_assume!(idx <= n);
        let mut buf = IrBuffer::new();
        for i in 0..n {
            let k = buf.intern_const(ConstVal::Int(i as i32)).unwrap();
            buf.emit_raw(Op::Kint, IrType::new(TypeTag::Int), k, 0).unwrap();
        }
        let to_ref: Ref = REF_FIRST + idx as Ref;
        buf.rollback(to_ref);
        buf.rollback(to_ref);
        prop_assert_eq!(buf.next_ref(), to_ref);
    }

    /// Patching an exit to the same target twice never changes the
    /// recorded target on the second call, whatever the starting target
    /// and whatever address the patch lands at.
    #[test]
    fn patch_exit_is_idempotent_for_any_target(
        initial in any::<usize>(),
        target in any::<usize>(),
    ) {
        let mut mcode = McodeArena::new(32, 512);
        let (top, _) = mcode.reserve().unwrap();
        mcode.commit(top);
        let mut current = initial;
        patch_exit(&mut mcode, top, &mut current, target).unwrap();
        prop_assert_eq!(current, target);
        patch_exit(&mut mcode, top, &mut current, target).unwrap();
        prop_assert_eq!(current, target);
    }
}
