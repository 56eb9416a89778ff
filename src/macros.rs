//! Declarative helpers for the protocol and error tables.

/// Declares numeric error codes together with a lookup for their messages.
macro_rules! define_error_codes {
    ($($name:ident = $code:literal => $msg:expr),* $(,)?) => {
        $(
            pub const $name: u32 = $code;
        )*

        /// Returns the human-readable message for a numeric error code.
        pub fn get_error_message(code: u32) -> &'static str {
            match code {
                $($code => $msg,)*
                _ => "Unknown Error",
            }
        }
    };
}

/// Declares the command codes carried at header offset 0x26.
macro_rules! define_command_type {
    ($($name:ident = $val:literal),* $(,)?) => {
        /// Command codes understood by the hub firmware.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum CommandType {
            $($name = $val,)*
        }

        impl CommandType {
            pub fn from_u16(val: u16) -> Option<Self> {
                match val {
                    $($val => Some(CommandType::$name),)*
                    _ => None,
                }
            }

            pub fn code(self) -> u16 {
                self as u16
            }
        }

        impl std::fmt::Display for CommandType {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(CommandType::$name => write!(f, "{}(0x{:02X})", stringify!($name), $val),)*
                }
            }
        }
    };
}
