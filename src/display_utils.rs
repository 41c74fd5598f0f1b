use std::fmt::{Debug, Display, LowerHex};

pub struct HexNum<N: LowerHex>(pub N);

impl<N: LowerHex> Debug for HexNum<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        LowerHex::fmt(&self.0, f)
    }
}

impl<N: LowerHex> Display for HexNum<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}
