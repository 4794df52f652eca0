//! Native function pointer types that jit compiled functions can be called through

use cranelift::codegen::ir::types::{F32, F64, I16, I32, I64, I8};
use cranelift::codegen::ir::Type;
use itertools::Itertools as _;

/// A scalar that is passed in the same way as a cranelift value of type [NativeType::TYPE]
pub trait NativeType: Copy {
    const TYPE: Type;
}

macro_rules! native_type {
    ($($rust:ty => $ir:ident),* $(,)?) => {
        $(
        impl NativeType for $rust {
            const TYPE: Type = $ir;
        }
        )*
    };
}

native_type! {
    i8 => I8,
    u8 => I8,
    i16 => I16,
    u16 => I16,
    i32 => I32,
    u32 => I32,
    i64 => I64,
    u64 => I64,
    f32 => F32,
    f64 => F64,
}

/// What a native function can return
pub trait NativeReturn {
    fn types() -> Vec<Type>;
}

impl<T: NativeType> NativeReturn for T {
    fn types() -> Vec<Type> {
        vec![T::TYPE]
    }
}

impl NativeReturn for () {
    fn types() -> Vec<Type> {
        vec![]
    }
}

/// A function pointer type that jit compiled code can be called through.
///
/// # Safety
/// Implementors must be `extern "C"` function pointers whose parameters and returns are
/// passed exactly like the cranelift types reported by [param_types](Self::param_types) and
/// [return_types](Self::return_types).
pub unsafe trait NativeFunction: Copy {
    fn param_types() -> Vec<Type>;

    fn return_types() -> Vec<Type>;

    /// Reinterprets the address of compiled code as this function type.
    ///
    /// # Safety
    /// `code` must point at finalized code with the signature of this function type.
    unsafe fn from_code(code: *const u8) -> Self;

    /// Renders the signature like cranelift renders signatures, without a calling convention
    fn describe() -> String {
        let params = Self::param_types().iter().join(", ");
        match Self::return_types().as_slice() {
            [] => format!("({params})"),
            returns => format!("({params}) -> {}", returns.iter().join(", ")),
        }
    }
}

macro_rules! native_function {
    ($($arg:ident),*) => {
        unsafe impl<R: NativeReturn, $($arg: NativeType),*> NativeFunction for extern "C" fn($($arg),*) -> R {
            fn param_types() -> Vec<Type> {
                vec![$($arg::TYPE),*]
            }

            fn return_types() -> Vec<Type> {
                R::types()
            }

            unsafe fn from_code(code: *const u8) -> Self {
                std::mem::transmute_copy::<*const u8, Self>(&code)
            }
        }
    };
}

native_function!();
native_function!(A);
native_function!(A, B);
native_function!(A, B, C);
native_function!(A, B, C, D);
