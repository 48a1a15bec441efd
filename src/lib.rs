pub mod device;
pub mod fs;

#[cfg(test)]
mod test;
