pub mod binary_xml;
pub mod manifest_patch;
pub mod zip;

/// Framework resource ids of the `android:` attributes the patcher touches.
pub mod attr {
    pub const THEME: u32 = 0x0101_0000;
    pub const LABEL: u32 = 0x0101_0001;
    pub const ICON: u32 = 0x0101_0002;
    pub const NAME: u32 = 0x0101_0003;
    pub const PERMISSION: u32 = 0x0101_0006;
    pub const AUTHORITIES: u32 = 0x0101_0018;
    pub const EXPORTED: u32 = 0x0101_001e;
    pub const MIN_SDK_VERSION: u32 = 0x0101_020c;
    pub const INIT_ORDER: u32 = 0x0101_0427;
}
