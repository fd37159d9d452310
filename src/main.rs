// RdpClipGuard entry point

fn main() {
    rdpclip_guard_lib::run()
}
