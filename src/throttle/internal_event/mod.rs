//! Registered metric handles emitted by the throttle components.
//!
//! Each event is registered once (resolving its `metrics` handles) and then emitted many times
//! from hot paths without further registry lookups.

pub mod throttle;

pub use self::throttle::*;

/// A registered event that can be emitted repeatedly with per-emission data.
pub trait InternalEventHandle: Sized {
    type Data: Sized;

    fn emit(&self, data: Self::Data);
}

/// Declares a registered event: a struct of metric handles built by `register()` and an
/// `emit` body run for every emission.
#[macro_export]
macro_rules! registered_event {
    (
        $event:ident => {
            $( $field:ident: $type:ty = $value:expr, )*
        }

        fn emit(&$slf:ident, $data_name:ident: $data:ty)
            $emit_body:block
    ) => {
        #[derive(Clone)]
        pub struct $event {
            $( pub $field: $type, )*
        }

        impl $event {
            pub fn register() -> Self {
                Self {
                    $( $field: $value, )*
                }
            }
        }

        impl std::fmt::Debug for $event {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($event)).finish_non_exhaustive()
            }
        }

        impl $crate::throttle::internal_event::InternalEventHandle for $event {
            type Data = $data;

            fn emit(&$slf, $data_name: $data)
                $emit_body
        }
    };
}
