//! Declarative helpers for the wire enums and the error code table.

/// Defines `CommandType` with its wire codes and a lossless `from_u32`.
macro_rules! define_command_type {
    ($($name:ident = $code:literal),+ $(,)?) => {
        /// Tuya local protocol command codes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum CommandType {
            $($name = $code),+
        }

        impl CommandType {
            /// Maps a raw wire code back to a command.
            pub fn from_u32(code: u32) -> Option<Self> {
                match code {
                    $($code => Some(CommandType::$name),)+
                    _ => None,
                }
            }

            pub fn code(self) -> u32 {
                self as u32
            }
        }

        impl std::fmt::Display for CommandType {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:?}(0x{:02X})", self, *self as u32)
            }
        }
    };
}

/// Defines `Version` with its wire string and numeric value.
macro_rules! define_version {
    ($($name:ident = ($text:literal, $val:literal)),+ $(,)?) => {
        /// Local protocol version, fixed when a link is created.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Version {
            $($name),+
        }

        impl Version {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Version::$name => $text),+
                }
            }

            pub fn as_bytes(&self) -> &'static [u8] {
                self.as_str().as_bytes()
            }

            pub fn val(&self) -> f32 {
                match self {
                    $(Version::$name => $val),+
                }
            }
        }

        impl std::str::FromStr for Version {
            type Err = $crate::error::TuyaError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok(Version::$name),)+
                    other => Err($crate::error::TuyaError::UnsupportedVersion(other.to_string())),
                }
            }
        }

        impl TryFrom<f32> for Version {
            type Error = $crate::error::TuyaError;

            fn try_from(v: f32) -> std::result::Result<Self, Self::Error> {
                $(if (v - $val).abs() < f32::EPSILON {
                    return Ok(Version::$name);
                })+
                Err($crate::error::TuyaError::UnsupportedVersion(v.to_string()))
            }
        }

        impl TryFrom<&str> for Version {
            type Error = $crate::error::TuyaError;

            fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Defines numeric error code constants and `get_error_message`.
macro_rules! define_error_codes {
    ($($name:ident = $code:literal => $msg:literal),+ $(,)?) => {
        $(pub const $name: u32 = $code;)+

        /// Human-readable description for an error code.
        pub fn get_error_message(code: u32) -> &'static str {
            match code {
                $($code => $msg,)+
                _ => "Unknown Error",
            }
        }
    };
}
