use crate::alignment::Alignment;
use crate::chunks::SectionId;
use crate::elf::SegmentRecord;
use object::elf::PF_R;
use object::elf::PF_W;
use object::elf::PF_X;
use object::elf::PT_LOAD;
use smallvec::SmallVec;

/// One program header: a run of sections the loader sees as a unit. LOAD segments are created by
/// grouping allocatable sections; PHDR, INTERP and DYNAMIC reference sections that some LOAD
/// already covers.
pub struct Segment {
    pub(crate) ty: u32,
    pub(crate) flags: u32,
    pub(crate) alignment: Alignment,
    pub(crate) file_offset: u64,
    pub(crate) virtual_address: u64,
    pub(crate) file_size: u64,
    pub(crate) mem_size: u64,
    pub(crate) members: SmallVec<[SectionId; 8]>,
}

impl Segment {
    pub(crate) fn new(ty: u32, flags: u32, alignment: Alignment) -> Self {
        Self {
            ty,
            flags,
            alignment,
            file_offset: 0,
            virtual_address: 0,
            file_size: 0,
            mem_size: 0,
            members: SmallVec::new(),
        }
    }

    pub(crate) fn is_load(&self) -> bool {
        self.ty == PT_LOAD
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }

    pub(crate) fn is_executable(&self) -> bool {
        self.flags & PF_X != 0
    }

    pub(crate) fn record(&self) -> SegmentRecord {
        SegmentRecord {
            ty: self.ty,
            flags: self.flags,
            offset: self.file_offset,
            virtual_address: self.virtual_address,
            file_size: self.file_size,
            mem_size: self.mem_size,
            alignment: self.alignment.value(),
        }
    }
}

/// Permission flags for a LOAD segment holding the given mix of sections.
pub(crate) fn load_flags(writable: bool, any_executable: bool) -> u32 {
    let mut flags = PF_R;
    if writable {
        flags |= PF_W;
    }
    if any_executable {
        flags |= PF_X;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_flags_cover_the_usual_groups() {
        assert_eq!(load_flags(false, true), PF_R | PF_X);
        assert_eq!(load_flags(false, false), PF_R);
        assert_eq!(load_flags(true, false), PF_R | PF_W);
    }
}
