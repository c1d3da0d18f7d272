//! Small hand-written modules shared by the tests of this crate.

use morph_ir::{
    validate_module, BasicBlock, Function, Id, Instruction, IrContext, Module, Opcode,
    StorageClass,
};

use crate::fact_manager::FactManager;
use crate::id_allocator::CounterOverflowIdSource;
use crate::transformation::TransformationContext;

pub const VOID: Id = Id(1);
pub const VOID_FN: Id = Id(2);
pub const INT: Id = Id(3);
pub const UINT: Id = Id(4);
pub const BOOL: Id = Id(5);
pub const INT_PTR: Id = Id(6);
pub const INT_ZERO: Id = Id(7);
pub const INT_ONE: Id = Id(8);
pub const TRUE: Id = Id(9);
pub const FALSE: Id = Id(10);
pub const INT_TWO: Id = Id(11);
pub const INT_THREE: Id = Id(12);
pub const INT_FOUR: Id = Id(13);
pub const INT_TEN: Id = Id(14);
pub const INT_FN: Id = Id(15);
pub const UINT_FIVE: Id = Id(16);

// Diamond with a store on the true side
pub const MAIN: Id = Id(100);
pub const ENTRY: Id = Id(20);
pub const TRUE_BLOCK: Id = Id(21);
pub const FALSE_BLOCK: Id = Id(22);
pub const MERGE_BLOCK: Id = Id(23);
pub const ADD_RESULT: Id = Id(30);
pub const PHI_RESULT: Id = Id(31);
pub const MERGE_ADD: Id = Id(32);
pub const VAR: Id = Id(40);

// Selection with an empty true side
pub const FLAT_FN: Id = Id(101);
pub const FLAT_HEADER: Id = Id(50);
pub const FLAT_FALSE: Id = Id(51);
pub const FLAT_MERGE: Id = Id(52);
pub const FLAT_ADD: Id = Id(60);
pub const FLAT_PHI: Id = Id(61);

// Loops containing returns; labels are `base + k`
pub const RET_FN: Id = Id(102);
pub const RET_BASE: u32 = 70;
pub const RETV_FN: Id = Id(106);
pub const RETV_BASE: u32 = 90;

// Straight-line code to outline
pub const OUT_FN: Id = Id(103);
pub const OUT_ENTRY: Id = Id(110);
pub const OUT_A: Id = Id(111);
pub const OUT_B: Id = Id(112);
pub const OUT_EXIT: Id = Id(113);
pub const OUT_VAR: Id = Id(120);
pub const OUT_SUM: Id = Id(121);
pub const OUT_PRODUCT: Id = Id(122);
pub const OUT_LAST: Id = Id(123);

// Loop header reached from two blocks outside the loop
pub const PRE_FN: Id = Id(104);
pub const PRE_ENTRY: Id = Id(130);
pub const PRE_SIDE: Id = Id(131);
pub const PRE_HEADER: Id = Id(132);
pub const PRE_BODY: Id = Id(133);
pub const PRE_MERGE: Id = Id(134);
pub const PRE_PHI: Id = Id(140);
pub const PRE_NEXT: Id = Id(141);

// Selection whose declared merge block is not where control reconverges
pub const FAKE_FN: Id = Id(105);
pub const FAKE_HEADER: Id = Id(150);
pub const FAKE_LEFT: Id = Id(151);
pub const FAKE_RIGHT: Id = Id(152);
pub const FAKE_CONVERGENCE: Id = Id(153);
pub const FAKE_MERGE: Id = Id(154);
pub const FAKE_PHI: Id = Id(160);

/// First overflow id used by test transformation contexts
// Bitwise operations on 8-bit integers
pub const BITS_FN: Id = Id(107);
pub const BITS_ENTRY: Id = Id(170);
pub const BYTE: Id = Id(171);
pub const SBYTE: Id = Id(172);
pub const BYTE_A: Id = Id(173);
pub const BYTE_B: Id = Id(174);
pub const SBYTE_C: Id = Id(175);
/// Unsigned 32-bit constants 0..8 take ids 176..184
pub const BITS_INDEX_ZERO: u32 = 176;
pub const BITS_INDEX_SEVEN: Id = Id(183);
pub const BITS_OR: Id = Id(185);
pub const BITS_NOT: Id = Id(186);
pub const BITS_SUM: Id = Id(187);
pub const BITS_MIXED_AND: Id = Id(188);

pub const FIRST_OVERFLOW_ID: u32 = 10_000;

fn block(label: Id, instructions: Vec<Instruction>) -> BasicBlock {
    BasicBlock::with_instructions(label, instructions)
}

pub fn globals() -> Module {
    let mut module = Module::new();
    module.add_global(Instruction::type_void(VOID));
    module.add_global(Instruction::type_function(VOID_FN, VOID, &[]));
    module.add_global(Instruction::type_int(INT, 32, true));
    module.add_global(Instruction::type_int(UINT, 32, false));
    module.add_global(Instruction::type_bool(BOOL));
    module.add_global(Instruction::type_pointer(INT_PTR, StorageClass::Function, INT));
    module.add_global(Instruction::constant(INT, INT_ZERO, 0));
    module.add_global(Instruction::constant(INT, INT_ONE, 1));
    module.add_global(Instruction::constant_bool(BOOL, TRUE, true));
    module.add_global(Instruction::constant_bool(BOOL, FALSE, false));
    module.add_global(Instruction::constant(INT, INT_TWO, 2));
    module.add_global(Instruction::constant(INT, INT_THREE, 3));
    module.add_global(Instruction::constant(INT, INT_FOUR, 4));
    module.add_global(Instruction::constant(INT, INT_TEN, 10));
    module.add_global(Instruction::type_function(INT_FN, INT, &[]));
    module.add_global(Instruction::constant(UINT, UINT_FIVE, 5));
    module
}

pub fn diamond_function() -> Function {
    let mut f = Function::new(MAIN, VOID, VOID_FN);
    f.add_block(block(
        ENTRY,
        vec![
            Instruction::variable(INT_PTR, VAR, StorageClass::Function),
            Instruction::store(VAR, INT_ZERO),
            Instruction::selection_merge(MERGE_BLOCK),
            Instruction::branch_conditional(TRUE, TRUE_BLOCK, FALSE_BLOCK),
        ],
    ));
    f.add_block(block(
        TRUE_BLOCK,
        vec![
            Instruction::binary(Opcode::IAdd, INT, ADD_RESULT, INT_ONE, INT_TWO),
            Instruction::store(VAR, ADD_RESULT),
            Instruction::branch(MERGE_BLOCK),
        ],
    ));
    f.add_block(block(FALSE_BLOCK, vec![Instruction::branch(MERGE_BLOCK)]));
    f.add_block(block(
        MERGE_BLOCK,
        vec![
            Instruction::phi(
                INT,
                PHI_RESULT,
                &[(ADD_RESULT, TRUE_BLOCK), (INT_ZERO, FALSE_BLOCK)],
            ),
            Instruction::binary(Opcode::IAdd, INT, MERGE_ADD, PHI_RESULT, INT_ONE),
            Instruction::store(VAR, MERGE_ADD),
            Instruction::return_void(),
        ],
    ));
    f
}

pub fn flatten_function() -> Function {
    let mut f = Function::new(FLAT_FN, VOID, VOID_FN);
    f.add_block(block(
        FLAT_HEADER,
        vec![
            Instruction::selection_merge(FLAT_MERGE),
            Instruction::branch_conditional(TRUE, FLAT_MERGE, FLAT_FALSE),
        ],
    ));
    f.add_block(block(
        FLAT_FALSE,
        vec![
            Instruction::binary(Opcode::IAdd, INT, FLAT_ADD, INT_ONE, INT_ONE),
            Instruction::branch(FLAT_MERGE),
        ],
    ));
    f.add_block(block(
        FLAT_MERGE,
        vec![
            Instruction::phi(INT, FLAT_PHI, &[(INT_ZERO, FLAT_HEADER), (FLAT_ADD, FLAT_FALSE)]),
            Instruction::binary(Opcode::IAdd, INT, Id(62), FLAT_PHI, INT_ONE),
            Instruction::return_void(),
        ],
    ));
    f
}

/// entry -> loop header; the loop returns from its body (`base + 2`) and
/// exits through its merge block (`base + 4`) to a second return
/// (`base + 5`)
pub fn returns_function(id: Id, base: u32, returns_value: bool) -> Function {
    let label = |k: u32| Id(base + k);
    let (return_type, function_type) = if returns_value {
        (INT, INT_FN)
    } else {
        (VOID, VOID_FN)
    };
    let ret = |value: Id| {
        if returns_value {
            Instruction::return_value(value)
        } else {
            Instruction::return_void()
        }
    };

    let mut f = Function::new(id, return_type, function_type);
    f.add_block(block(label(0), vec![Instruction::branch(label(1))]));
    f.add_block(block(
        label(1),
        vec![
            Instruction::loop_merge(label(4), label(3)),
            Instruction::branch_conditional(TRUE, label(2), label(3)),
        ],
    ));
    f.add_block(block(label(2), vec![ret(INT_ONE)]));
    f.add_block(block(
        label(3),
        vec![Instruction::branch_conditional(FALSE, label(1), label(4))],
    ));
    f.add_block(block(label(4), vec![Instruction::branch(label(5))]));
    f.add_block(block(label(5), vec![ret(INT_TWO)]));
    f
}

pub fn outline_function() -> Function {
    let mut f = Function::new(OUT_FN, VOID, VOID_FN);
    f.add_block(block(
        OUT_ENTRY,
        vec![
            Instruction::variable(INT_PTR, OUT_VAR, StorageClass::Function),
            Instruction::branch(OUT_A),
        ],
    ));
    f.add_block(block(
        OUT_A,
        vec![
            Instruction::binary(Opcode::IAdd, INT, OUT_SUM, INT_ONE, INT_TWO),
            Instruction::branch(OUT_B),
        ],
    ));
    f.add_block(block(
        OUT_B,
        vec![
            Instruction::binary(Opcode::IMul, INT, OUT_PRODUCT, OUT_SUM, OUT_SUM),
            Instruction::store(OUT_VAR, OUT_PRODUCT),
            Instruction::branch(OUT_EXIT),
        ],
    ));
    f.add_block(block(
        OUT_EXIT,
        vec![
            Instruction::binary(Opcode::IAdd, INT, OUT_LAST, OUT_PRODUCT, INT_ONE),
            Instruction::store(OUT_VAR, OUT_LAST),
            Instruction::return_void(),
        ],
    ));
    f
}

pub fn preheader_function() -> Function {
    let mut f = Function::new(PRE_FN, VOID, VOID_FN);
    f.add_block(block(
        PRE_ENTRY,
        vec![
            Instruction::selection_merge(PRE_HEADER),
            Instruction::branch_conditional(TRUE, PRE_SIDE, PRE_HEADER),
        ],
    ));
    f.add_block(block(PRE_SIDE, vec![Instruction::branch(PRE_HEADER)]));
    f.add_block(block(
        PRE_HEADER,
        vec![
            Instruction::phi(
                INT,
                PRE_PHI,
                &[(INT_ONE, PRE_ENTRY), (INT_TWO, PRE_SIDE), (PRE_NEXT, PRE_BODY)],
            ),
            Instruction::loop_merge(PRE_MERGE, PRE_BODY),
            Instruction::branch(PRE_BODY),
        ],
    ));
    f.add_block(block(
        PRE_BODY,
        vec![
            Instruction::binary(Opcode::IAdd, INT, PRE_NEXT, PRE_PHI, INT_ONE),
            Instruction::branch_conditional(FALSE, PRE_HEADER, PRE_MERGE),
        ],
    ));
    f.add_block(block(PRE_MERGE, vec![Instruction::return_void()]));
    f
}

pub fn fake_merge_function() -> Function {
    let mut f = Function::new(FAKE_FN, VOID, VOID_FN);
    f.add_block(block(
        FAKE_HEADER,
        vec![
            Instruction::selection_merge(FAKE_MERGE),
            Instruction::branch_conditional(TRUE, FAKE_LEFT, FAKE_RIGHT),
        ],
    ));
    f.add_block(block(FAKE_LEFT, vec![Instruction::branch(FAKE_CONVERGENCE)]));
    f.add_block(block(FAKE_RIGHT, vec![Instruction::branch(FAKE_CONVERGENCE)]));
    f.add_block(block(
        FAKE_CONVERGENCE,
        vec![
            Instruction::phi(INT, FAKE_PHI, &[(INT_ONE, FAKE_LEFT), (INT_TWO, FAKE_RIGHT)]),
            Instruction::new(Opcode::ControlBarrier),
            Instruction::branch(FAKE_MERGE),
        ],
    ));
    f.add_block(block(FAKE_MERGE, vec![Instruction::return_void()]));
    f
}

pub fn bits_function() -> Function {
    let mut f = Function::new(BITS_FN, VOID, VOID_FN);
    f.add_block(block(
        BITS_ENTRY,
        vec![
            Instruction::binary(Opcode::BitwiseOr, BYTE, BITS_OR, BYTE_A, BYTE_B),
            Instruction::unary(Opcode::Not, BYTE, BITS_NOT, BITS_OR),
            Instruction::binary(Opcode::IAdd, BYTE, BITS_SUM, BITS_NOT, BYTE_B),
            Instruction::binary(Opcode::BitwiseAnd, BYTE, BITS_MIXED_AND, BYTE_A, SBYTE_C),
            Instruction::return_void(),
        ],
    ));
    f
}

fn with_functions(functions: Vec<Function>) -> Module {
    let mut module = globals();
    for f in functions {
        module.add_function(f);
    }
    module
}

pub fn diamond_with_store() -> Module {
    with_functions(vec![diamond_function()])
}

pub fn empty_true_branch() -> Module {
    with_functions(vec![flatten_function()])
}

pub fn loop_with_returns(returns_value: bool) -> Module {
    if returns_value {
        with_functions(vec![returns_function(RETV_FN, RETV_BASE, true)])
    } else {
        with_functions(vec![returns_function(RET_FN, RET_BASE, false)])
    }
}

pub fn straight_line() -> Module {
    with_functions(vec![outline_function()])
}

pub fn loop_with_two_entries() -> Module {
    with_functions(vec![preheader_function()])
}

pub fn fake_merge() -> Module {
    with_functions(vec![fake_merge_function()])
}

/// 8-bit bitwise operations, with the bit index constants they need
pub fn bit_operations() -> Module {
    let mut module = globals();
    module.add_global(Instruction::type_int(BYTE, 8, false));
    module.add_global(Instruction::type_int(SBYTE, 8, true));
    module.add_global(Instruction::constant(BYTE, BYTE_A, 0b1010_0110));
    module.add_global(Instruction::constant(BYTE, BYTE_B, 0b0000_1111));
    module.add_global(Instruction::constant(SBYTE, SBYTE_C, 3));
    for i in 0..8 {
        module.add_global(Instruction::constant(UINT, Id(BITS_INDEX_ZERO + i), u64::from(i)));
    }
    module.add_function(bits_function());
    module
}

/// Every fixture function in one module
pub fn all_features() -> Module {
    with_functions(vec![
        diamond_function(),
        flatten_function(),
        returns_function(RET_FN, RET_BASE, false),
        returns_function(RETV_FN, RETV_BASE, true),
        outline_function(),
        preheader_function(),
        fake_merge_function(),
    ])
}

pub fn transformation_context() -> TransformationContext {
    TransformationContext::new(
        FactManager::new(),
        Box::new(CounterOverflowIdSource::new(FIRST_OVERFLOW_ID)),
    )
}

pub fn assert_valid(ctx: &IrContext) {
    if let Err(e) = validate_module(ctx) {
        panic!("invalid module: {}\n{:#?}", e, ctx.module());
    }
}

#[test]
fn fixtures_are_valid() {
    assert_valid(&IrContext::new(all_features()));
    assert_valid(&IrContext::new(bit_operations()));
}
