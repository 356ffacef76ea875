#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IType {
    None = 0,
    Dir = 1,
    File = 2,
    Device = 3,
}

impl Default for IType {
    fn default() -> Self {
        IType::None
    }
}

impl IType {
    pub fn from_u16(bits: u16) -> Option<IType> {
        match bits {
            0 => Some(IType::None),
            1 => Some(IType::Dir),
            2 => Some(IType::File),
            3 => Some(IType::Device),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Stat {
    pub dev: u32,     // File system's disk device
    pub ino: u32,     // Inode number
    pub itype: IType, // Type of file
    pub nlink: u16,   // Number of links to file
    pub size: u64,    // Size of file in bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn itype_round_trips() {
        for t in [IType::None, IType::Dir, IType::File, IType::Device] {
            assert_eq!(IType::from_u16(t as u16), Some(t));
        }
        assert_eq!(IType::from_u16(4), None);
    }
}
