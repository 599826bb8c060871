use iota::iota;

// Operand layout, in bytes following the opcode:
//   CONSTANT, *_GLOBAL, *_PROPERTY, CLASS: constant index (1)
//   *_LOCAL, *_UPVALUE, CALL: slot / index / argument count (1)
//   JUMP, JUMP_IF_FALSE, LOOP: big-endian offset (2)
//   CLOSURE: constant index (1), then (is_local, index) per upvalue (2 each)
iota! {
    pub const CONSTANT: u8 = iota;
            , NULL
            , TRUE
            , FALSE
            , POP
            , GET_LOCAL
            , SET_LOCAL
            , GET_GLOBAL
            , DEFINE_GLOBAL
            , SET_GLOBAL
            , GET_UPVALUE
            , SET_UPVALUE
            , GET_PROPERTY
            , SET_PROPERTY
            , EQUAL
            , GREATER
            , LESS
            , ADD
            , SUBTRACT
            , MULTIPLY
            , DIVIDE
            , NOT
            , NEGATE
            , PRINT
            , JUMP
            , JUMP_IF_FALSE
            , LOOP
            , CALL
            , CLOSURE
            , CLOSE_UPVALUE
            , RETURN
            , CLASS
}
