//! Build script for nftpolicy
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! for `nftpolicy --version`.

fn main() {
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
